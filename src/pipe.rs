//! Control-plane transport to the parent process.
//!
//! Every message is a little-endian `u32` payload length followed by the
//! payload, whose first byte is a tag:
//! - inbound: `c` + serialized parameters, `e` to terminate
//! - outbound: `r` ready, `d`/`s` + `u64` LE timestamp + primary/secondary
//!   data, `e` + error text

use anyhow::{anyhow, bail, Context, Result};
use std::io::{self, Read, Write};
use std::sync::Mutex;

/// Longest outbound error payload, tag included.
pub const MAX_ERROR_PAYLOAD: usize = 255;
/// Inbound messages are parameter snapshots; anything bigger is corrupt.
pub const MAX_INBOUND_MESSAGE: u32 = 1 << 20;

const TAG_CONFIGURE: u8 = b'c';
const TAG_EXIT: u8 = b'e';
const TAG_READY: u8 = b'r';
const TAG_DATA: u8 = b'd';
const TAG_SECONDARY: u8 = b's';
const TAG_ERROR: u8 = b'e';

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// New serialized parameter snapshot.
    Configure(Vec<u8>),
    Exit,
    Unknown(u8),
}

impl Command {
    pub fn parse(message: &[u8]) -> Result<Self> {
        let (&tag, body) = message
            .split_first()
            .ok_or_else(|| anyhow!("empty control message"))?;
        Ok(match tag {
            TAG_CONFIGURE => Self::Configure(body.to_vec()),
            TAG_EXIT => Self::Exit,
            other => Self::Unknown(other),
        })
    }
}

pub struct CommandReader<R> {
    inner: R,
}

impl<R: Read> CommandReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next raw message; `None` when the pipe closes between messages.
    pub fn read_message(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len = [0u8; 4];
        match self.inner.read_exact(&mut len) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err).context("read message length"),
        }
        let len = u32::from_le_bytes(len);
        if len > MAX_INBOUND_MESSAGE {
            bail!("control message of {} bytes exceeds the limit", len);
        }
        let mut payload = vec![0u8; len as usize];
        self.inner
            .read_exact(&mut payload)
            .context("read message payload")?;
        Ok(Some(payload))
    }

    pub fn next_command(&mut self) -> Result<Option<Command>> {
        match self.read_message()? {
            Some(message) => Ok(Some(Command::parse(&message)?)),
            None => Ok(None),
        }
    }
}

/// Outbound half; writes from different threads never interleave.
pub struct PipeWriter {
    inner: Mutex<Box<dyn Write + Send>>,
}

impl PipeWriter {
    pub fn new<W: Write + Send + 'static>(inner: W) -> Self {
        Self {
            inner: Mutex::new(Box::new(inner)),
        }
    }

    pub fn write_ready(&self) -> Result<()> {
        self.write_message(&[&[TAG_READY][..]])
    }

    pub fn write_data(&self, data: &[u8], timestamp_us: u64) -> Result<()> {
        self.write_message(&[&[TAG_DATA][..], &timestamp_us.to_le_bytes()[..], data])
    }

    pub fn write_secondary(&self, data: &[u8], timestamp_us: u64) -> Result<()> {
        self.write_message(&[&[TAG_SECONDARY][..], &timestamp_us.to_le_bytes()[..], data])
    }

    pub fn write_error(&self, message: &str) -> Result<()> {
        let text = truncate(message, MAX_ERROR_PAYLOAD - 1);
        self.write_message(&[&[TAG_ERROR][..], text.as_bytes()])
    }

    fn write_message(&self, parts: &[&[u8]]) -> Result<()> {
        let len: usize = parts.iter().map(|part| part.len()).sum();
        let len = u32::try_from(len).map_err(|_| anyhow!("message of {} bytes too large", len))?;
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("pipe writer lock poisoned"))?;
        inner.write_all(&len.to_le_bytes())?;
        for part in parts {
            inner.write_all(part)?;
        }
        inner.flush()?;
        Ok(())
    }
}

/// Cut `text` to at most `max` bytes on a character boundary.
fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "poisoned"))?
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn messages(buf: &SharedBuf) -> Result<Vec<Vec<u8>>> {
        let bytes = buf.0.lock().map_err(|_| anyhow!("poisoned"))?.clone();
        let mut reader = CommandReader::new(bytes.as_slice());
        let mut out = Vec::new();
        while let Some(message) = reader.read_message()? {
            out.push(message);
        }
        Ok(out)
    }

    #[test]
    fn data_message_layout() -> Result<()> {
        let buf = SharedBuf::default();
        let writer = PipeWriter::new(buf.clone());
        writer.write_data(&[0xaa, 0xbb], 0x0102_0304_0506_0708)?;
        let raw = buf.0.lock().map_err(|_| anyhow!("poisoned"))?.clone();
        assert_eq!(&raw[..4], &11u32.to_le_bytes());
        assert_eq!(raw[4], b'd');
        assert_eq!(&raw[5..13], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&raw[13..], &[0xaa, 0xbb]);
        Ok(())
    }

    #[test]
    fn ready_secondary_and_error_messages() -> Result<()> {
        let buf = SharedBuf::default();
        let writer = PipeWriter::new(buf.clone());
        writer.write_ready()?;
        writer.write_secondary(b"jpeg", 5)?;
        writer.write_error("camera driver exited")?;
        let messages = messages(&buf)?;
        assert_eq!(messages[0], b"r");
        assert_eq!(messages[1][0], b's');
        assert_eq!(&messages[1][9..], b"jpeg");
        assert_eq!(messages[2], b"ecamera driver exited");
        Ok(())
    }

    #[test]
    fn error_text_is_truncated() -> Result<()> {
        let buf = SharedBuf::default();
        let writer = PipeWriter::new(buf.clone());
        writer.write_error(&"é".repeat(400))?;
        let messages = messages(&buf)?;
        assert!(messages[0].len() <= MAX_ERROR_PAYLOAD);
        assert!(std::str::from_utf8(&messages[0][1..]).is_ok());
        Ok(())
    }

    #[test]
    fn commands_parse_and_eof_ends_stream() -> Result<()> {
        let mut input = Vec::new();
        for payload in [&b"cV2lkdGg6NjQw"[..], &b"x"[..], &b"e"[..]] {
            input.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            input.extend_from_slice(payload);
        }
        let mut reader = CommandReader::new(input.as_slice());
        assert_eq!(
            reader.next_command()?,
            Some(Command::Configure(b"V2lkdGg6NjQw".to_vec()))
        );
        assert_eq!(reader.next_command()?, Some(Command::Unknown(b'x')));
        assert_eq!(reader.next_command()?, Some(Command::Exit));
        assert_eq!(reader.next_command()?, None);
        Ok(())
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut input = 10u32.to_le_bytes().to_vec();
        input.extend_from_slice(b"c12");
        let mut reader = CommandReader::new(input.as_slice());
        assert!(reader.next_command().is_err());
    }

    #[test]
    fn concurrent_writers_do_not_interleave() -> Result<()> {
        let buf = SharedBuf::default();
        let writer = Arc::new(PipeWriter::new(buf.clone()));
        let threads: Vec<_> = (0..4u8)
            .map(|id| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        writer.write_data(&[id; 64], id as u64)?;
                    }
                    Ok::<_, anyhow::Error>(())
                })
            })
            .collect();
        for thread in threads {
            thread.join().expect("writer thread")?;
        }
        let messages = messages(&buf)?;
        assert_eq!(messages.len(), 200);
        for message in messages {
            let id = message[1];
            assert!(message[9..].iter().all(|byte| *byte == id));
        }
        Ok(())
    }
}
