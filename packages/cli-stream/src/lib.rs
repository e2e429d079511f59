//! Wire model for the assistant CLI's stream-json output.
//!
//! The CLI emits one JSON object per event on stdout, usually newline
//! delimited but occasionally concatenated. [`parse::JsonStreamParser`]
//! recovers complete objects from the byte stream and [`events::CliEvent`]
//! gives them a typed shape with an `Unknown` catch-all.

pub mod events;
pub mod parse;

pub use events::{BlockDelta, BlockType, CliEvent, ContentBlockInfo, ResultEvent, Usage};
pub use parse::JsonStreamParser;
