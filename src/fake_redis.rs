//! In-process stand-in for a Redis server, for tests only.
//!
//! Understands arrays of bulk strings, which is all a client ever sends.
//! `INCR` keeps real counters, `PUBLISH` answers with a fixed receiver count,
//! `SUBSCRIBE` confirms and then plays back a script. Anything else
//! (connection setup, `CLIENT`, `SELECT`, `PING`) gets `+OK`.

use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// What a subscribed connection does after confirming `SUBSCRIBE`
#[derive(Clone, Debug)]
pub enum AfterSubscribe {
    /// Push these payloads, then keep the socket open
    Push(Vec<String>),
    /// Push these payloads, then close the socket
    PushThenDrop(Vec<String>),
}

#[derive(Clone)]
pub struct FakeRedis {
    counters: Arc<Mutex<HashMap<String, i64>>>,
    after_subscribe: AfterSubscribe,
}

impl FakeRedis {
    pub fn new() -> Self {
        FakeRedis {
            counters: Arc::new(Mutex::new(HashMap::new())),
            after_subscribe: AfterSubscribe::Push(Vec::new()),
        }
    }

    pub fn after_subscribe(mut self, script: AfterSubscribe) -> Self {
        self.after_subscribe = script;
        self
    }

    /// Serve every accepted connection until the test ends; returns `redis://` URL
    pub async fn spawn(self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(self.clone().serve(socket));
            }
        });
        format!("redis://{}/", addr)
    }

    async fn serve(self, mut socket: TcpStream) {
        let mut buf = BytesMut::new();
        loop {
            while let Some(command) = parse_command(&mut buf) {
                let Some(name) = command.first().map(|c| c.to_ascii_uppercase()) else {
                    continue;
                };
                let reply = match name.as_str() {
                    "INCR" => {
                        let mut counters = self.counters.lock().await;
                        let n = counters.entry(command[1].clone()).or_insert(0);
                        *n += 1;
                        format!(":{}\r\n", n)
                    }
                    "PUBLISH" => ":1\r\n".to_string(),
                    "SUBSCRIBE" => {
                        let channel = command.get(1).cloned().unwrap_or_default();
                        let mut out = push(&["subscribe", &channel], Some(1));
                        let (payloads, drop_after) = match &self.after_subscribe {
                            AfterSubscribe::Push(p) => (p.clone(), false),
                            AfterSubscribe::PushThenDrop(p) => (p.clone(), true),
                        };
                        for payload in payloads {
                            out.push_str(&push(&["message", &channel, &payload], None));
                        }
                        if socket.write_all(out.as_bytes()).await.is_err() || drop_after {
                            return;
                        }
                        continue;
                    }
                    _ => "+OK\r\n".to_string(),
                };
                if socket.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
            match socket.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

fn push(parts: &[&str], count: Option<i64>) -> String {
    let len = parts.len() + usize::from(count.is_some());
    let mut out = format!("*{}\r\n", len);
    for part in parts {
        out.push_str(&format!("${}\r\n{}\r\n", part.len(), part));
    }
    if let Some(n) = count {
        out.push_str(&format!(":{}\r\n", n));
    }
    out
}

/// Pop one complete `*N` array of bulk strings off the front of `buf`
fn parse_command(buf: &mut BytesMut) -> Option<Vec<String>> {
    let mut pos = 0;
    let header = read_line(buf, &mut pos)?;
    let count: usize = header.strip_prefix('*')?.parse().ok()?;
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let len: usize = read_line(buf, &mut pos)?.strip_prefix('$')?.parse().ok()?;
        if buf.len() < pos + len + 2 {
            return None;
        }
        parts.push(String::from_utf8_lossy(&buf[pos..pos + len]).into_owned());
        pos += len + 2;
    }
    buf.advance(pos);
    Some(parts)
}

fn read_line(buf: &BytesMut, pos: &mut usize) -> Option<String> {
    let rest = &buf[*pos..];
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    let line = String::from_utf8_lossy(&rest[..end]).into_owned();
    *pos += end + 2;
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_waits_for_full_frame() {
        let mut buf = BytesMut::from(&b"*2\r\n$4\r\nINCR\r\n$3\r\nab"[..]);
        assert!(parse_command(&mut buf).is_none());
        buf.extend_from_slice(b"c\r\n");
        assert_eq!(parse_command(&mut buf), Some(vec!["INCR".to_string(), "abc".to_string()]));
        assert!(buf.is_empty());
    }
}
