use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::sync::{
    ProgressEvent, ProgressSink, SampleTypeTransferResult, SpacesResult, SyncResult,
};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_sync(result: &SyncResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_sample_types(result: &SampleTypeTransferResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_spaces(result: &SpacesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Keeps stdout for the JSON result and reports progress through tracing on stderr.
impl ProgressSink for JsonOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
