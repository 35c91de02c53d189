// # RESP Surface
//
// Redis-compatible line protocol over TCP: GET, SET (with optional EX),
// DEL, EXISTS, EXPIRE, PING and QUIT, answering `-MOVED <addr>` when the
// contacted node is not the key's primary. This is a thin adapter: all
// semantics live in the router and the engine. Commands operate on the
// node's designated default store.

use crate::cluster::router::{OpOutcome, Operation, RequestContext, RequestRouter, Surface};
use crate::common::new_correlation_id;
use crate::error::{CacheError, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Upper bound on a single bulk string, matching the HTTP body limit.
const MAX_BULK_LEN: usize = 8 * 1024 * 1024;

/// Upper bound on arguments per command.
const MAX_ARGS: usize = 64;

pub struct RespServer {
    router: Arc<RequestRouter>,
    default_store: String,
    shutdown: watch::Receiver<bool>,
}

impl RespServer {
    pub fn new(
        router: Arc<RequestRouter>,
        default_store: String,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            router,
            default_store,
            shutdown,
        }
    }

    /// Accept loop. Runs until the shutdown channel flips.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| CacheError::Transport(e.to_string()))?;
        info!(addr = %addr, "RESP server listening");
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            debug!(peer = %peer, "RESP connection accepted");
                            let router = self.router.clone();
                            let store = self.default_store.clone();
                            let conn_shutdown = self.shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(socket, router, store, conn_shutdown).await
                                {
                                    debug!(peer = %peer, error = %e, "RESP connection closed with error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "RESP accept failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("RESP server stopping");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    router: Arc<RequestRouter>,
    default_store: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let command = tokio::select! {
            parsed = read_command(&mut reader) => parsed?,
            _ = shutdown.changed() => return Ok(()),
        };
        let Some(args) = command else {
            return Ok(()); // client hung up
        };
        if args.is_empty() {
            continue;
        }

        let reply = dispatch(&router, &default_store, &args).await;
        write_half.write_all(&reply).await?;
        write_half.flush().await?;

        if args[0].eq_ignore_ascii_case(b"QUIT") {
            return Ok(());
        }
    }
}

/// Read one command: either a RESP array of bulk strings or an inline
/// whitespace-separated line. Returns None on a clean EOF.
async fn read_command<R>(reader: &mut R) -> Result<Option<Vec<Vec<u8>>>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Ok(Some(Vec::new()));
    }

    if let Some(count) = line.strip_prefix('*') {
        let count: usize = count
            .parse()
            .map_err(|_| CacheError::Protocol(format!("bad array header: {line}")))?;
        if count > MAX_ARGS {
            return Err(CacheError::Protocol(format!("too many arguments: {count}")));
        }
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            args.push(read_bulk(reader).await?);
        }
        return Ok(Some(args));
    }

    // Inline command.
    Ok(Some(
        line.split_whitespace()
            .map(|part| part.as_bytes().to_vec())
            .collect(),
    ))
}

async fn read_bulk<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut header = String::new();
    if reader.read_line(&mut header).await? == 0 {
        return Err(CacheError::Protocol("eof inside array".into()));
    }
    let header = header.trim_end_matches(['\r', '\n']);
    let len: usize = header
        .strip_prefix('$')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| CacheError::Protocol(format!("bad bulk header: {header}")))?;
    if len > MAX_BULK_LEN {
        return Err(CacheError::Protocol(format!("bulk string too large: {len}")));
    }
    let mut buf = vec![0u8; len + 2]; // payload + CRLF
    reader.read_exact(&mut buf).await?;
    buf.truncate(len);
    Ok(buf)
}

async fn dispatch(router: &RequestRouter, store: &str, args: &[Vec<u8>]) -> Vec<u8> {
    let ctx = RequestContext::new(Surface::Resp, new_correlation_id());
    let command = args[0].to_ascii_uppercase();
    match command.as_slice() {
        b"PING" => match args.get(1) {
            Some(message) => bulk(message),
            None => simple("PONG"),
        },
        b"QUIT" => simple("OK"),
        b"GET" => {
            if args.len() != 2 {
                return error("ERR wrong number of arguments for 'get' command");
            }
            let op = Operation::Get {
                store: store.to_string(),
                key: args[1].clone(),
            };
            match router.execute(op, &ctx).await {
                Ok(OpOutcome::Value { value, .. }) => bulk(&value),
                Ok(OpOutcome::Missing) => null_bulk(),
                Ok(_) => error("ERR unexpected reply"),
                Err(e) => error_reply(e),
            }
        }
        b"SET" => {
            if args.len() != 3 && args.len() != 5 {
                return error("ERR wrong number of arguments for 'set' command");
            }
            let ttl_secs = if args.len() == 5 {
                if !args[3].eq_ignore_ascii_case(b"EX") {
                    return error("ERR syntax error");
                }
                match std::str::from_utf8(&args[4]).ok().and_then(|s| s.parse().ok()) {
                    Some(ttl) => Some(ttl),
                    None => return error("ERR value is not an integer or out of range"),
                }
            } else {
                None
            };
            let op = Operation::Put {
                store: store.to_string(),
                key: args[1].clone(),
                value: args[2].clone(),
                ttl_secs,
            };
            match router.execute(op, &ctx).await {
                Ok(OpOutcome::Stored { .. }) => simple("OK"),
                Ok(_) => error("ERR unexpected reply"),
                Err(e) => error_reply(e),
            }
        }
        b"DEL" => {
            if args.len() < 2 {
                return error("ERR wrong number of arguments for 'del' command");
            }
            let mut removed = 0i64;
            for key in &args[1..] {
                let op = Operation::Delete {
                    store: store.to_string(),
                    key: key.clone(),
                };
                match router.execute(op, &ctx).await {
                    Ok(OpOutcome::Deleted { removed: true }) => removed += 1,
                    Ok(_) => {}
                    Err(e) => return error_reply(e),
                }
            }
            integer(removed)
        }
        b"EXISTS" => {
            if args.len() < 2 {
                return error("ERR wrong number of arguments for 'exists' command");
            }
            let mut found = 0i64;
            for key in &args[1..] {
                let op = Operation::Exists {
                    store: store.to_string(),
                    key: key.clone(),
                };
                match router.execute(op, &ctx).await {
                    Ok(OpOutcome::Exists { exists: true }) => found += 1,
                    Ok(_) => {}
                    Err(e) => return error_reply(e),
                }
            }
            integer(found)
        }
        b"EXPIRE" => {
            if args.len() != 3 {
                return error("ERR wrong number of arguments for 'expire' command");
            }
            let Some(ttl_secs) = std::str::from_utf8(&args[2])
                .ok()
                .and_then(|s| s.parse().ok())
            else {
                return error("ERR value is not an integer or out of range");
            };
            let op = Operation::Expire {
                store: store.to_string(),
                key: args[1].clone(),
                ttl_secs,
            };
            match router.execute(op, &ctx).await {
                Ok(OpOutcome::Stored { .. }) => integer(1),
                Ok(OpOutcome::Missing) => integer(0),
                Ok(_) => error("ERR unexpected reply"),
                Err(e) => error_reply(e),
            }
        }
        other => error(&format!(
            "ERR unknown command '{}'",
            String::from_utf8_lossy(other)
        )),
    }
}

// Reply encoders

fn simple(message: &str) -> Vec<u8> {
    format!("+{message}\r\n").into_bytes()
}

fn error(message: &str) -> Vec<u8> {
    format!("-{message}\r\n").into_bytes()
}

fn error_reply(e: CacheError) -> Vec<u8> {
    match e {
        CacheError::NotPrimary { owner } => format!("-MOVED {owner}\r\n").into_bytes(),
        other => error(&format!("ERR {other}")),
    }
}

fn bulk(payload: &[u8]) -> Vec<u8> {
    let mut reply = format!("${}\r\n", payload.len()).into_bytes();
    reply.extend_from_slice(payload);
    reply.extend_from_slice(b"\r\n");
    reply
}

fn null_bulk() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

fn integer(value: i64) -> Vec<u8> {
    format!(":{value}\r\n").into_bytes()
}
