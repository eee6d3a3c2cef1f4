//! Command execution against the gateway's control socket.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};

use mx6e::command::{Request, Response};
use mx6e::ctrlsock::{CommandStream, MAX_RECORD};

use crate::args;

/// Send one request; print any text the daemon streams back.
pub fn execute(process_name: &str, request: &Request) -> Result<()> {
    let stream = CommandStream::connect(process_name)
        .with_context(|| format!("connecting to gateway {process_name:?} (is it running?)"))?;

    let record = serde_json::to_vec(request).context("encoding request")?;
    stream.send(&record).context("sending request")?;

    let mut buf = vec![0u8; MAX_RECORD];
    let len = stream.recv(&mut buf).context("reading response")?;
    if len == 0 {
        bail!("gateway closed the connection without a response");
    }
    let response: Response =
        serde_json::from_slice(&buf[..len]).context("decoding response")?;
    if !response.is_ok() {
        bail!("{} failed: {}", request.name(), response.message);
    }

    // Show-style commands stream raw text until EOF.
    let stdout = io::stdout();
    let mut out = stdout.lock();
    loop {
        let len = stream.recv(&mut buf).context("reading output")?;
        if len == 0 {
            break;
        }
        out.write_all(&buf[..len]).context("writing output")?;
    }
    out.flush().ok();
    Ok(())
}

/// Replay a command file: one command per line, `#` starts a comment.
/// Lines may carry any table, but the usual convention is one file per
/// table matching the `load` argument.
pub fn load(process_name: &str, table: &str, file: &Path) -> Result<()> {
    // The table argument is validated even though each line names its
    // own table; a typo should fail before any command runs.
    args::parse_kind(table)?;

    let text =
        fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;

    for (idx, raw) in text.lines().enumerate() {
        let line = match raw.split_once('#') {
            Some((before, _)) => before.trim(),
            None => raw.trim(),
        };
        if line.is_empty() {
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let request = args::request_from_tokens(&tokens)
            .with_context(|| format!("{}:{}", file.display(), idx + 1))?;
        execute(process_name, &request)
            .with_context(|| format!("{}:{}", file.display(), idx + 1))?;
    }
    Ok(())
}
