use crate::application::engine::Command;
use crate::error::{MarketError, Result};
use std::io::Read;

/// Reads marketplace commands from a CSV source.
///
/// Whitespace around fields is trimmed and short rows are accepted, so a script only
/// needs the columns its commands use.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes one command per row.
    pub fn commands(self) -> impl Iterator<Item = Result<Command>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(MarketError::from))
    }
}
