//! Command-line client for the meshdird control socket.
//!
//! Usage:
//!   meshdir-client list_services
//!   meshdir-client commit_service '{"name": "Mesh Chat", "description": "chat app", "uri": "http://10.0.0.1:8080", "icon": "chat.png"}'
//!   meshdir-client remove_service 9f86d081...

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use shared::codec::{Map, Value};
use shared::protocol::{Request, Response, RESPONSE_MAX};

#[derive(Parser, Debug)]
#[command(name = "meshdir-client")]
#[command(about = "Send a command to the meshdird control socket")]
#[command(version)]
struct Args {
    /// Path to the control socket
    #[arg(short, long, default_value = "/run/meshdird.sock")]
    socket: PathBuf,

    /// Request id echoed back in the response
    #[arg(long, default_value_t = 1)]
    id: u32,

    /// Command name
    command: String,

    /// Parameters, each JSON or a plain string
    params: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let params = args
        .params
        .iter()
        .map(|param| parse_param(param))
        .collect::<Result<Vec<_>>>()?;
    let request = Request::new(args.id, args.command.as_str(), params);
    let bytes = request.encode().context("Request too large")?;

    let mut stream = UnixStream::connect(&args.socket)
        .with_context(|| format!("Failed to connect to {}", args.socket.display()))?;
    stream.write_all(&bytes).context("Failed to send request")?;

    let mut buf = vec![0u8; RESPONSE_MAX];
    let n = stream.read(&mut buf).context("Failed to read response")?;
    if n == 0 {
        bail!("Daemon closed the connection without answering");
    }
    let response = Response::decode(&buf[..n]).context("Malformed response")?;
    if response.id != args.id {
        bail!("Response id {} does not match request id {}", response.id, args.id);
    }

    match response.outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(error) => {
            eprintln!("{}", serde_json::to_string_pretty(&error)?);
            std::process::exit(1);
        }
    }
}

/// Reads a parameter as JSON, falling back to the raw string.
fn parse_param(param: &str) -> Result<Value> {
    match serde_json::from_str::<serde_json::Value>(param) {
        Ok(json) => to_value(json),
        Err(_) => Ok(Value::from(param)),
    }
}

fn to_value(json: serde_json::Value) -> Result<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_u64() {
            Some(n) => Value::uint(n),
            None => bail!("Only unsigned integers are supported, got {}", n),
        },
        serde_json::Value::String(s) => Value::from(s),
        serde_json::Value::Array(items) => Value::List(
            items
                .into_iter()
                .map(to_value)
                .collect::<Result<Vec<_>>>()?,
        ),
        serde_json::Value::Object(fields) => {
            let mut map = Map::new();
            for (key, value) in fields {
                map.try_insert(key, to_value(value)?)?;
            }
            Value::Map(map)
        }
    })
}
