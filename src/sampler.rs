//! [C4] Sampler: configurable stochastic token picker. Opaque from the
//! scheduler's view except `reset/accept/sample/get_candidates`
//! (spec.md §3/§4.2). Wraps `gg::sampling::LlamaSampler` the way the
//! teacher's `inference.rs` builds its mirostat/top-k chain, generalized to
//! the full knob set in spec.md §6.

use gg::context::LlamaContext;
use gg::sampling::LlamaSampler as GgSampler;
use gg::token::LlamaToken;
use serde::{Deserialize, Serialize};

use crate::grammar::Grammar;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub typical_p: f32,
    pub top_n_sigma: f32,
    pub xtc_probability: f32,
    pub xtc_threshold: f32,
    pub repeat_last_n: i32,
    pub repeat_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub dry_multiplier: f32,
    pub dry_base: f32,
    pub dry_allowed_length: i32,
    pub dry_penalty_last_n: i32,
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub dynatemp_range: f32,
    pub dynatemp_exponent: f32,
    pub seed: Option<u32>,
    pub n_probs: i32,
    pub min_keep: usize,
    pub samplers: Vec<String>,
    pub logit_bias: Vec<(i64, f32)>,
    pub grammar: Option<String>,
    pub json_schema: Option<serde_json::Value>,
    pub grammar_triggers: Vec<String>,
    pub preserved_tokens: Vec<String>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            top_n_sigma: -1.0,
            xtc_probability: 0.0,
            xtc_threshold: 0.1,
            repeat_last_n: 64,
            repeat_penalty: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            dry_multiplier: 0.0,
            dry_base: 1.75,
            dry_allowed_length: 2,
            dry_penalty_last_n: -1,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            dynatemp_range: 0.0,
            dynatemp_exponent: 1.0,
            seed: None,
            n_probs: 0,
            min_keep: 1,
            samplers: Vec::new(),
            logit_bias: Vec::new(),
            grammar: None,
            json_schema: None,
            grammar_triggers: Vec::new(),
            preserved_tokens: Vec::new(),
        }
    }
}

/// A single `{token, logprob}` candidate, exposed when `n_probs > 0` /
/// `post_sampling_probs` is requested (spec.md §6).
#[derive(Debug, Clone, Serialize)]
pub struct TokenCandidate {
    pub id: i32,
    pub logprob: f32,
}

pub struct Sampler {
    chain: GgSampler,
    grammar: Option<Grammar>,
    grammar_lazy_armed: bool,
    cfg: SamplerConfig,
}

impl Sampler {
    pub fn new(cfg: SamplerConfig) -> eyre::Result<Self> {
        let seed = cfg.seed.unwrap_or_else(rand::random);
        let grammar = match (&cfg.grammar, &cfg.json_schema) {
            (Some(gbnf), _) => Some(Grammar::from_gbnf(gbnf)?),
            (None, Some(schema)) => Some(Grammar::from_json_schema(schema)?),
            (None, None) => None,
        };
        let grammar_lazy_armed = cfg.grammar_triggers.is_empty();

        let mut stages = Vec::new();
        if cfg.repeat_penalty != 1.0 || cfg.presence_penalty != 0.0 || cfg.frequency_penalty != 0.0 {
            stages.push(GgSampler::penalties(
                cfg.repeat_last_n,
                cfg.repeat_penalty,
                cfg.frequency_penalty,
                cfg.presence_penalty,
            ));
        }
        if cfg.dry_multiplier > 0.0 {
            stages.push(GgSampler::dry(
                cfg.dry_penalty_last_n,
                cfg.dry_multiplier,
                cfg.dry_base,
                cfg.dry_allowed_length,
            ));
        }
        if cfg.mirostat != 0 {
            stages.push(GgSampler::temp(cfg.temperature));
            stages.push(GgSampler::mirostat_v2(seed, cfg.mirostat_tau, cfg.mirostat_eta));
        } else if cfg.temperature <= 0.0 {
            stages.push(GgSampler::greedy());
        } else {
            if cfg.top_k > 0 {
                stages.push(GgSampler::top_k(cfg.top_k));
            }
            if cfg.typical_p < 1.0 {
                stages.push(GgSampler::typical(cfg.typical_p, cfg.min_keep));
            }
            if cfg.top_p < 1.0 {
                stages.push(GgSampler::top_p(cfg.top_p, cfg.min_keep));
            }
            if cfg.min_p > 0.0 {
                stages.push(GgSampler::min_p(cfg.min_p, cfg.min_keep));
            }
            if cfg.dynatemp_range > 0.0 {
                stages.push(GgSampler::temp_ext(
                    cfg.temperature,
                    cfg.dynatemp_range,
                    cfg.dynatemp_exponent,
                ));
            } else {
                stages.push(GgSampler::temp(cfg.temperature));
            }
            stages.push(GgSampler::dist(seed));
        }

        let mut chain = GgSampler::chain_simple(stages);
        if !cfg.logit_bias.is_empty() {
            let bias: Vec<_> = cfg
                .logit_bias
                .iter()
                .map(|&(id, b)| (LlamaToken::new(id as i32), b))
                .collect();
            chain = chain.with_logit_bias(bias);
        }

        Ok(Self {
            chain,
            grammar,
            grammar_lazy_armed,
            cfg,
        })
    }

    pub fn reset(&mut self) {
        self.chain.reset();
        if let Some(g) = &mut self.grammar {
            g.reset();
        }
        self.grammar_lazy_armed = self.cfg.grammar_triggers.is_empty();
    }

    /// Prime repetition-penalty/dry state with already-seen tokens (e.g. the
    /// prompt) without sampling.
    pub fn with_tokens(&mut self, tokens: impl Iterator<Item = i32>) {
        for t in tokens {
            self.chain.accept(LlamaToken::new(t));
        }
    }

    pub fn accept(&mut self, token: i32) {
        self.chain.accept(LlamaToken::new(token));
        if let Some(g) = &mut self.grammar {
            if self.grammar_lazy_armed {
                g.accept(token);
            }
        }
    }

    /// Arm a lazily-activated grammar once `text` contains one of the
    /// configured `grammar_triggers` (spec.md §6 `grammar_triggers`).
    pub fn maybe_arm_grammar(&mut self, text: &str) {
        if !self.grammar_lazy_armed
            && self.cfg.grammar_triggers.iter().any(|t| text.contains(t.as_str()))
        {
            self.grammar_lazy_armed = true;
        }
    }

    pub fn sample_at(&mut self, ctx: &LlamaContext, logits_idx: i32) -> LlamaToken {
        if let (Some(grammar), true) = (&mut self.grammar, self.grammar_lazy_armed) {
            grammar.constrain(ctx, logits_idx)
        }
        self.chain.sample(ctx, logits_idx)
    }

    pub fn get_candidates(&self, ctx: &LlamaContext, logits_idx: i32, top_n: usize) -> Vec<TokenCandidate> {
        self.chain
            .candidates(ctx, logits_idx)
            .into_iter()
            .take(top_n)
            .map(|(id, logprob)| TokenCandidate { id: id.0, logprob })
            .collect()
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.cfg
    }
}
