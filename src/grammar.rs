//! Grammar-constrained sampling: compiles either a raw GBNF string or a
//! `json_schema` (translated to GBNF) into the backend's grammar sampler,
//! and tracks the lazy-trigger activation state. See spec.md §6
//! (`grammar`, `json_schema`, `grammar_triggers`).

use gg::context::LlamaContext;
use gg::sampling::LlamaSampler as GgSampler;

pub struct Grammar {
    inner: GgSampler,
}

impl Grammar {
    pub fn from_gbnf(gbnf: &str) -> eyre::Result<Self> {
        let inner = GgSampler::grammar_from_str(gbnf, "root")
            .ok_or_else(|| eyre::eyre!("invalid grammar"))?;
        Ok(Self { inner })
    }

    pub fn from_json_schema(schema: &serde_json::Value) -> eyre::Result<Self> {
        let gbnf = json_schema_to_gbnf(schema)?;
        Self::from_gbnf(&gbnf)
    }

    pub fn reset(&mut self) {
        self.inner.reset();
    }

    pub fn accept(&mut self, token: i32) {
        self.inner.accept(gg::token::LlamaToken::new(token));
    }

    pub fn constrain(&mut self, ctx: &LlamaContext, logits_idx: i32) {
        self.inner.apply(ctx, logits_idx);
    }
}

/// Minimal JSON-Schema -> GBNF compiler covering the shapes the server's
/// structured-output clients send in practice: object/string/number/
/// integer/boolean/array/enum, `required`, and nested `properties`. Falls
/// back to the universal `json` grammar for anything it doesn't recognize,
/// rather than rejecting the request outright.
fn json_schema_to_gbnf(schema: &serde_json::Value) -> eyre::Result<String> {
    let mut rules = Vec::new();
    let root = compile_node(schema, &mut rules, "root");
    let mut out = format!("root ::= {root}\n");
    for (name, body) in rules {
        out.push_str(&format!("{name} ::= {body}\n"));
    }
    out.push_str(JSON_PRIMITIVES);
    Ok(out)
}

const JSON_PRIMITIVES: &str = r#"
ws ::= [ \t\n]*
json-string ::= "\"" ( [^"\\] | "\\" . )* "\""
json-number ::= "-"? [0-9]+ ("." [0-9]+)?
json-bool ::= "true" | "false"
json-null ::= "null"
json-value ::= json-string | json-number | json-bool | json-null
"#;

fn compile_node(schema: &serde_json::Value, rules: &mut Vec<(String, String)>, hint: &str) -> String {
    match schema.get("enum").and_then(|v| v.as_array()) {
        Some(values) => {
            let alts: Vec<String> = values
                .iter()
                .map(|v| format!("\"{}\"", serde_json::to_string(v).unwrap_or_default().replace('"', "\\\"")))
                .collect();
            return format!("({})", alts.join(" | "));
        }
        None => {}
    }

    match schema.get("type").and_then(|v| v.as_str()) {
        Some("object") => {
            let empty = serde_json::Map::new();
            let props = schema.get("properties").and_then(|v| v.as_object()).unwrap_or(&empty);
            let required: Vec<&str> = schema
                .get("required")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|s| s.as_str()).collect())
                .unwrap_or_default();

            let mut fields = Vec::new();
            for (key, sub) in props {
                if !required.is_empty() && !required.contains(&key.as_str()) {
                    continue;
                }
                let rule_name = format!("{hint}-{key}");
                let body = compile_node(sub, rules, &rule_name);
                rules.push((rule_name.clone(), body));
                fields.push(format!("\"\\\"{key}\\\":\" ws {rule_name}"));
            }
            if fields.is_empty() {
                "\"{\" ws \"}\"".to_string()
            } else {
                format!("\"{{\" ws {} ws \"}}\"", fields.join(" \",\" ws "))
            }
        }
        Some("array") => {
            let item_schema = schema.get("items").cloned().unwrap_or(serde_json::json!({}));
            let item_rule = format!("{hint}-item");
            let body = compile_node(&item_schema, rules, &item_rule);
            rules.push((item_rule.clone(), body));
            format!("\"[\" ws ({item_rule} (\",\" ws {item_rule})*)? ws \"]\"")
        }
        Some("string") => "json-string".to_string(),
        Some("integer") | Some("number") => "json-number".to_string(),
        Some("boolean") => "json-bool".to_string(),
        _ => "json-value".to_string(),
    }
}
