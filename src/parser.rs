use std::fs;
use std::path::Path;

use diffusion_core::StreamEvent;

pub struct ParseResult {
    pub events: Vec<StreamEvent>,
    pub errors: Vec<ParseError>,
}

pub struct ParseError {
    pub line: usize,
    pub message: String,
}

pub fn parse_stream(path: &Path) -> Result<ParseResult, std::io::Error> {
    let content = fs::read_to_string(path)?;
    Ok(parse_lines(&content))
}

/// One event per line. Blank lines and `//` comments are skipped.
pub fn parse_lines(content: &str) -> ParseResult {
    let mut events = Vec::new();
    let mut errors = Vec::new();

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        match StreamEvent::from_json(line) {
            Ok(event) => events.push(event),
            Err(e) => errors.push(ParseError {
                line: i + 1,
                message: e.to_string(),
            }),
        }
    }

    ParseResult { events, errors }
}
