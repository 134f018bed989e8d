//! Interactive REPL loop (spec.md §6 "CLI surface"). A `reqwest` client
//! against `/v1/chat/completions`, streamed and printed token-by-token the
//! way the teacher's `cli/repl.rs` pumps `Display` off a UNIX-socket
//! connection — here the "connection" is just an HTTP base URL, which is
//! why `--connect` and the in-process `--interactive` path share this one
//! function.

use eyre::{eyre, Result};
use futures_util::StreamExt;
use rustyline::error::ReadlineError;
use serde_json::{json, Value};

struct Turn {
    role: &'static str,
    content: String,
}

pub async fn run(base_url: String) -> Result<()> {
    let client = reqwest::Client::new();
    let mut history: Vec<Turn> = Vec::new();
    let mut rl = rustyline::DefaultEditor::new().map_err(|e| eyre!(e))?;

    loop {
        let line = match rl.readline(">> ") {
            Ok(line) => line,
            Err(ReadlineError::Eof) => break,
            Err(ReadlineError::Interrupted) => {
                eprintln!("\ninterrupted");
                std::process::exit(130);
            }
            Err(e) => return Err(eyre!(e)),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        rl.add_history_entry(line).ok();

        match dispatch_special(line, &mut history) {
            Special::Exit => break,
            Special::Handled => continue,
            Special::Attach(text) => {
                // An attachment becomes context for the next turn, not a turn itself.
                history.push(Turn { role: "user", content: text });
                continue;
            }
            Special::NotSpecial => {
                history.push(Turn { role: "user", content: line.to_string() });
            }
        }

        let answer = send_turn(&client, &base_url, &history).await?;
        println!();
        history.push(Turn { role: "assistant", content: answer });
    }
    Ok(())
}

enum Special {
    NotSpecial,
    Handled,
    Exit,
    Attach(String),
}

fn dispatch_special(line: &str, history: &mut Vec<Turn>) -> Special {
    if line == "/exit" {
        return Special::Exit;
    }
    if line == "/clear" {
        history.clear();
        println!("(history cleared)");
        return Special::Handled;
    }
    if line == "/regen" {
        while matches!(history.last(), Some(t) if t.role == "assistant") {
            history.pop();
        }
        return Special::Handled;
    }
    if let Some(path) = line.strip_prefix("/read ") {
        return match std::fs::read_to_string(path.trim()) {
            Ok(contents) => Special::Attach(format!("(contents of {}):\n{}", path.trim(), contents)),
            Err(e) => {
                eprintln!("/read {path}: {e}");
                Special::Handled
            }
        };
    }
    if let Some(path) = line.strip_prefix("/image ") {
        return Special::Attach(format!("(attached image: {})", path.trim()));
    }
    if let Some(path) = line.strip_prefix("/audio ") {
        return Special::Attach(format!("(attached audio: {})", path.trim()));
    }
    Special::NotSpecial
}

async fn send_turn(client: &reqwest::Client, base_url: &str, history: &[Turn]) -> Result<String> {
    let messages: Vec<Value> = history.iter().map(|t| json!({"role": t.role, "content": t.content})).collect();
    let body = json!({"model": "default", "messages": messages, "stream": true});

    let resp = client.post(format!("{base_url}/v1/chat/completions")).json(&body).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(eyre!("server returned {status}: {text}"));
    }

    let mut stream = resp.bytes_stream();
    let mut buf = String::new();
    let mut answer = String::new();
    while let Some(chunk) = stream.next().await {
        buf.push_str(&String::from_utf8_lossy(&chunk?));
        while let Some(pos) = buf.find("\n\n") {
            let frame = buf[..pos].to_string();
            buf.drain(..pos + 2);
            for line in frame.lines() {
                let Some(data) = line.strip_prefix("data: ") else { continue };
                if data == "[DONE]" {
                    continue;
                }
                if let Ok(v) = serde_json::from_str::<Value>(data) {
                    if let Some(delta) = v["choices"][0]["delta"]["content"].as_str() {
                        print!("{delta}");
                        use std::io::Write;
                        let _ = std::io::stdout().flush();
                        answer.push_str(delta);
                    }
                }
            }
        }
    }
    Ok(answer)
}
