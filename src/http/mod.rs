pub mod parser;

pub use parser::{HttpParser, ParserError, ParserState, ParserType};
