use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{Value, json};

/// Largest tool output fed back to the model.
const MAX_OUTPUT: usize = 30_000;
const FETCH_MAX: usize = 50_000;

const BASH_TIMEOUT_SECS: u64 = 120;
const BASH_TIMEOUT_MAX_SECS: u64 = 600;
const GREP_TIMEOUT: Duration = Duration::from_secs(30);

/// OpenAI function-calling schemas for the permitted tools. Unknown
/// names are skipped, so a permission list may mention tools this
/// build does not ship.
pub fn schemas(permitted: &[String]) -> Vec<Value> {
    permitted.iter().filter_map(|name| schema(name)).collect()
}

fn schema(name: &str) -> Option<Value> {
    let (description, parameters) = match name {
        "bash" => (
            "Run a shell command and return its combined output.",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "The command to run" },
                    "timeout": {
                        "type": "integer",
                        "description": "Seconds before the command is killed (default 120, max 600)"
                    }
                },
                "required": ["command"]
            }),
        ),
        "read" => (
            "Read a file, returning numbered lines.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "Absolute path to the file" },
                    "offset": { "type": "integer", "description": "1-based line to start from" },
                    "limit": { "type": "integer", "description": "Maximum number of lines" }
                },
                "required": ["file_path"]
            }),
        ),
        "write" => (
            "Write content to a file, creating parent directories as needed.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "Absolute path to the file" },
                    "content": { "type": "string", "description": "Content to write" }
                },
                "required": ["file_path", "content"]
            }),
        ),
        "grep" => (
            "Search file contents with a regex. Returns matching file paths, or matching lines when include_content is true.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Regex to search for" },
                    "path": { "type": "string", "description": "File or directory to search (default .)" },
                    "include_content": {
                        "type": "boolean",
                        "description": "Return matching lines instead of just file paths"
                    }
                },
                "required": ["pattern"]
            }),
        ),
        "web_fetch" => (
            "Fetch a URL and return the response body.",
            json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "URL to fetch" }
                },
                "required": ["url"]
            }),
        ),
        _ => return None,
    };
    Some(json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        }
    }))
}

/// Runs one tool call. The returned text goes back to the model either
/// way; the flag is false when the tool itself failed to run (bad
/// arguments, spawn failure, timeout), not when a command merely exits
/// nonzero.
pub async fn execute(client: &reqwest::Client, name: &str, args: &Value) -> (String, bool) {
    let result = match name {
        "bash" => bash(args).await,
        "read" => read(args).await,
        "write" => write(args).await,
        "grep" => grep(args).await,
        "web_fetch" => web_fetch(client, args).await,
        other => Err(format!("unknown tool {:?}", other)),
    };
    match result {
        Ok(output) => (output, true),
        Err(message) => (format!("Error: {}", message), false),
    }
}

async fn bash(args: &Value) -> Result<String, String> {
    let Some(command) = args.get("command").and_then(|v| v.as_str()) else {
        return Err("no command provided".to_string());
    };
    let timeout = args
        .get("timeout")
        .and_then(|v| v.as_u64())
        .unwrap_or(BASH_TIMEOUT_SECS)
        .min(BASH_TIMEOUT_MAX_SECS);

    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn: {}", e))?;

    let output = match tokio::time::timeout(
        Duration::from_secs(timeout),
        child.wait_with_output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(format!("command failed: {}", e)),
        Err(_) => return Err(format!("command timed out after {}s", timeout)),
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    if !output.status.success() {
        text.push_str(&format!(
            "\n[exit code: {}]",
            output.status.code().unwrap_or(-1)
        ));
    }
    Ok(cap(text))
}

async fn read(args: &Value) -> Result<String, String> {
    let Some(path) = args.get("file_path").and_then(|v| v.as_str()) else {
        return Err("no file_path provided".to_string());
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("{}: {}", path, e))?;

    let offset = args
        .get("offset")
        .and_then(|v| v.as_u64())
        .map_or(0, |o| o.saturating_sub(1)) as usize;
    let limit = args
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(u64::MAX) as usize;

    let mut out = String::new();
    for (n, line) in raw.lines().enumerate().skip(offset).take(limit) {
        if line.len() > 2000 {
            let cut: String = line.chars().take(2000).collect();
            out.push_str(&format!("{:>6}\t{}...\n", n + 1, cut));
        } else {
            out.push_str(&format!("{:>6}\t{}\n", n + 1, line));
        }
    }
    if out.is_empty() {
        return Ok("(empty file)".to_string());
    }
    Ok(cap(out.trim_end().to_string()))
}

async fn write(args: &Value) -> Result<String, String> {
    let Some(path) = args.get("file_path").and_then(|v| v.as_str()) else {
        return Err("no file_path provided".to_string());
    };
    let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
    if let Some(parent) = Path::new(path).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("{}: {}", parent.display(), e))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| format!("{}: {}", path, e))?;
    Ok(format!("Wrote {} bytes to {}", content.len(), path))
}

async fn grep(args: &Value) -> Result<String, String> {
    let Some(pattern) = args.get("pattern").and_then(|v| v.as_str()) else {
        return Err("no pattern provided".to_string());
    };
    let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
    let with_lines = args
        .get("include_content")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    // Prefer ripgrep, fall back to plain grep when it is not installed.
    let rg_args: Vec<&str> = if with_lines {
        vec!["--no-heading", "--line-number", "--", pattern, path]
    } else {
        vec!["--files-with-matches", "--", pattern, path]
    };
    let output = match spawn_capture("rg", &rg_args).await {
        Ok(output) => output,
        Err(_) => {
            let grep_args: Vec<&str> = if with_lines {
                vec!["-rn", "--", pattern, path]
            } else {
                vec!["-rl", "--", pattern, path]
            };
            spawn_capture("grep", &grep_args)
                .await
                .map_err(|e| format!("search failed: {}", e))?
        }
    };

    let text = String::from_utf8_lossy(&output.stdout);
    if text.trim().is_empty() {
        return Ok("No matches found.".to_string());
    }
    Ok(cap(text.into_owned()))
}

async fn spawn_capture(bin: &str, args: &[&str]) -> std::io::Result<std::process::Output> {
    let fut = tokio::process::Command::new(bin)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();
    tokio::time::timeout(GREP_TIMEOUT, fut)
        .await
        .map_err(|_| std::io::Error::other("search timed out"))?
}

async fn web_fetch(client: &reqwest::Client, args: &Value) -> Result<String, String> {
    let Some(url) = args.get("url").and_then(|v| v.as_str()) else {
        return Err("no url provided".to_string());
    };
    let res = client
        .get(url)
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(|e| format!("fetch failed: {}", e))?;
    let status = res.status();
    if !status.is_success() {
        return Err(format!("{} returned {}", url, status));
    }
    let body = res
        .text()
        .await
        .map_err(|e| format!("read failed: {}", e))?;
    Ok(cap_at(body, FETCH_MAX))
}

fn cap(text: String) -> String {
    cap_at(text, MAX_OUTPUT)
}

fn cap_at(text: String, max: usize) -> String {
    if text.chars().count() <= max {
        return text;
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}\n... (truncated at {} chars)", cut, max)
}
