//! 通用工具

pub mod dates;
pub mod text;

pub use dates::{parse_period, Period, PeriodRequest};
pub use text::{
    clean_escapes, escape_html, markdown_to_html, preview, split_text, truncate_chars, TELEGRAM_MESSAGE_LIMIT,
};
