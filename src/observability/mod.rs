//! 日志初始化
//!
//! 默认 info，可通过 RUST_LOG 覆盖；输出前把机器人 token 等密钥替换为 `***`。

use std::io::{self, Write};
use std::sync::Arc;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 对每条日志做密钥替换后写入 stderr
#[derive(Clone, Default)]
pub struct RedactingWriter {
    secrets: Arc<Vec<String>>,
}

impl RedactingWriter {
    /// 忽略过短的值，避免误伤普通文本
    pub fn new(secrets: impl IntoIterator<Item = String>) -> Self {
        let secrets = secrets.into_iter().filter(|s| s.len() >= 8).collect();
        Self {
            secrets: Arc::new(secrets),
        }
    }

    pub fn redact(&self, line: &str) -> String {
        self.secrets
            .iter()
            .fold(line.to_string(), |acc, secret| acc.replace(secret.as_str(), "***"))
    }
}

pub struct RedactingLine {
    writer: RedactingWriter,
}

impl Write for RedactingLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        io::stderr().write_all(self.writer.redact(&line).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl<'a> MakeWriter<'a> for RedactingWriter {
    type Writer = RedactingLine;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingLine { writer: self.clone() }
    }
}

pub fn init(secrets: impl IntoIterator<Item = String>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,hyper=warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(RedactingWriter::new(secrets)))
        .init();
}
