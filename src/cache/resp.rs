use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, Framed};

use super::{CacheError, CounterStore};

/// Upper bound on a single bulk string; counters are tiny.
const MAX_BULK_LEN: usize = 1 << 20;

/// A RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<Reply>>),
}

/// RESP2 framing. Encodes commands as arrays of bulk strings; decodes any reply.
#[derive(Debug, Default)]
pub struct RespCodec;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

fn parse_int(line: &[u8]) -> io::Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid("bad integer in reply"))
}

/// Parse one value starting at `pos`. `Ok(None)` until the whole value is buffered.
fn parse(buf: &[u8], pos: usize) -> io::Result<Option<(Reply, usize)>> {
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    let Some(eol) = find_crlf(buf, pos + 1) else {
        return Ok(None);
    };
    let line = &buf[pos + 1..eol];
    let next = eol + 2;
    match tag {
        b'+' => Ok(Some((Reply::Simple(String::from_utf8_lossy(line).into_owned()), next))),
        b'-' => Ok(Some((Reply::Error(String::from_utf8_lossy(line).into_owned()), next))),
        b':' => Ok(Some((Reply::Integer(parse_int(line)?), next))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Reply::Bulk(None), next)));
            }
            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(invalid("bulk string too long"));
            }
            if buf.len() < next + len + 2 {
                return Ok(None);
            }
            if &buf[next + len..next + len + 2] != b"\r\n" {
                return Err(invalid("bulk string not terminated"));
            }
            let data = Bytes::copy_from_slice(&buf[next..next + len]);
            Ok(Some((Reply::Bulk(Some(data)), next + len + 2)))
        }
        b'*' => {
            let n = parse_int(line)?;
            if n < 0 {
                return Ok(Some((Reply::Array(None), next)));
            }
            let mut items = Vec::with_capacity((n as usize).min(64));
            let mut at = next;
            for _ in 0..n {
                match parse(buf, at)? {
                    Some((item, end)) => {
                        items.push(item);
                        at = end;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(Some(items)), at)))
        }
        other => Err(invalid(format!("unknown RESP type byte {other:#x}"))),
    }
}

impl Decoder for RespCodec {
    type Item = Reply;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, io::Error> {
        match parse(&src[..], 0)? {
            Some((reply, consumed)) => {
                src.advance(consumed);
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Vec<String>> for RespCodec {
    type Error = io::Error;

    fn encode(&mut self, args: Vec<String>, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.put_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            dst.put_slice(format!("${}\r\n", arg.len()).as_bytes());
            dst.put_slice(arg.as_bytes());
            dst.put_slice(b"\r\n");
        }
        Ok(())
    }
}

impl Encoder<Reply> for RespCodec {
    type Error = io::Error;

    fn encode(&mut self, reply: Reply, dst: &mut BytesMut) -> Result<(), io::Error> {
        match reply {
            Reply::Simple(s) => dst.put_slice(format!("+{s}\r\n").as_bytes()),
            Reply::Error(s) => dst.put_slice(format!("-{s}\r\n").as_bytes()),
            Reply::Integer(n) => dst.put_slice(format!(":{n}\r\n").as_bytes()),
            Reply::Bulk(None) => dst.put_slice(b"$-1\r\n"),
            Reply::Bulk(Some(data)) => {
                dst.put_slice(format!("${}\r\n", data.len()).as_bytes());
                dst.put_slice(&data);
                dst.put_slice(b"\r\n");
            }
            Reply::Array(None) => dst.put_slice(b"*-1\r\n"),
            Reply::Array(Some(items)) => {
                dst.put_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    Encoder::<Reply>::encode(self, item, dst)?;
                }
            }
        }
        Ok(())
    }
}

type Conn = Framed<TcpStream, RespCodec>;

/// Counters on a Redis-compatible server. One connection, reopened lazily
/// after any failed or abandoned exchange.
pub struct RespCounters {
    addr: String,
    timeout: Duration,
    conn: Mutex<Option<Conn>>,
}

impl RespCounters {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            conn: Mutex::new(None),
        }
    }

    /// One request/reply exchange. The connection is taken out of its slot
    /// for the whole exchange and returned only after `check` accepts the
    /// reply, so a dropped caller or an unexpected reply never leaves an
    /// unread or misaligned reply on a reused stream.
    async fn call<T>(
        &self,
        args: Vec<String>,
        check: impl FnOnce(Reply) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => {
                let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
                    .await
                    .map_err(|_| CacheError::Unavailable(format!("connect {} timed out", self.addr)))?
                    .map_err(|e| CacheError::Unavailable(format!("connect {}: {e}", self.addr)))?;
                stream.set_nodelay(true).ok();
                Framed::new(stream, RespCodec)
            }
        };

        let exchange = async {
            conn.send(args).await?;
            conn.next()
                .await
                .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed")))
        };
        let reply = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return Err(CacheError::Unavailable(format!("{}: {e}", self.addr))),
            Err(_) => return Err(CacheError::Unavailable(format!("{} timed out", self.addr))),
        };
        let value = match reply {
            Reply::Error(e) => Err(CacheError::Protocol(e)),
            reply => check(reply),
        }?;
        *slot = Some(conn);
        Ok(value)
    }
}

fn bulk_to_i64(data: &[u8]) -> Result<i64, CacheError> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CacheError::Protocol("counter value is not an integer".into()))
}

#[async_trait]
impl CounterStore for RespCounters {
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError> {
        self.call(vec!["GET".into(), key.into()], |reply| match reply {
            Reply::Bulk(None) => Ok(None),
            Reply::Bulk(Some(data)) => bulk_to_i64(&data).map(Some),
            Reply::Integer(n) => Ok(Some(n)),
            other => Err(CacheError::Protocol(format!("GET: unexpected reply {other:?}"))),
        })
        .await
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), CacheError> {
        self.call(vec!["SET".into(), key.into(), value.to_string()], |reply| match reply {
            Reply::Simple(_) => Ok(()),
            other => Err(CacheError::Protocol(format!("SET: unexpected reply {other:?}"))),
        })
        .await
    }

    async fn incrby(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.call(vec!["INCRBY".into(), key.into(), delta.to_string()], |reply| match reply {
            Reply::Integer(n) => Ok(n),
            other => Err(CacheError::Protocol(format!("INCRBY: unexpected reply {other:?}"))),
        })
        .await
    }
}
