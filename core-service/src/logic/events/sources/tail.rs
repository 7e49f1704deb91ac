//! File tail source
//!
//! Follows a plaintext log file: survives rotation (inode change or
//! truncation reopens the file), resumes from a cursor persisted in
//! `daemon_state`, and coalesces identical repeated lines inside a short
//! window so a producer flood becomes one event with a repeat count.

use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Instant;

use tokio::sync::watch;

use crate::constants;
use crate::logic::error::CoreResult;
use crate::logic::events::sources::parsers::Parser;
use crate::logic::events::sources::SourceContext;

pub struct TailSource {
    pub name: String,
    pub path: PathBuf,
    pub parser: Parser,
}

struct OpenFile {
    reader: BufReader<std::fs::File>,
    inode: u64,
    offset: u64,
}

/// Repeat-line coalescing inside a bounded window.
struct Coalescer {
    pending: Option<(String, u64, Instant)>,
}

impl Coalescer {
    fn new() -> Self {
        Self { pending: None }
    }

    /// Feed one line; returns a (line, repeats) pair when something is ready
    /// to emit.
    fn offer(&mut self, line: String) -> Option<(String, u64)> {
        let now = Instant::now();
        match self.pending.take() {
            Some((prev, count, since))
                if prev == line && now.duration_since(since) < constants::COALESCE_WINDOW =>
            {
                self.pending = Some((prev, count + 1, since));
                None
            }
            Some((prev, count, _)) => {
                self.pending = Some((line, 1, now));
                Some((prev, count))
            }
            None => {
                self.pending = Some((line, 1, now));
                None
            }
        }
    }

    /// Emit the pending line once its window has passed.
    fn flush_stale(&mut self) -> Option<(String, u64)> {
        match &self.pending {
            Some((_, _, since))
                if Instant::now().duration_since(*since) >= constants::COALESCE_WINDOW =>
            {
                self.pending.take().map(|(line, count, _)| (line, count))
            }
            _ => None,
        }
    }
}

impl TailSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, parser: Parser) -> Self {
        Self { name: name.into(), path: path.into(), parser }
    }

    fn cursor_key(&self) -> String {
        format!("cursor:{}", self.name)
    }

    fn inode_of(metadata: &std::fs::Metadata) -> u64 {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            metadata.ino()
        }
        #[cfg(not(unix))]
        {
            0
        }
    }

    fn open_at(&self, offset: u64) -> std::io::Result<OpenFile> {
        let file = std::fs::File::open(&self.path)?;
        let metadata = file.metadata()?;
        let inode = Self::inode_of(&metadata);
        let offset = offset.min(metadata.len());
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset))?;
        Ok(OpenFile { reader, inode, offset })
    }

    /// Run until shutdown. Errors bubble up so the supervisor can restart
    /// the source with backoff.
    pub async fn run(&self, ctx: &SourceContext, mut shutdown: watch::Receiver<bool>) -> CoreResult<()> {
        // Resume from the persisted cursor; a fresh source starts at the end
        // of the file rather than replaying history.
        let stored = ctx.store.get_state(&self.cursor_key()).await?;
        let mut open = match stored.and_then(|v| parse_cursor(&v)) {
            Some((inode, offset)) => {
                let open = self.open_at(offset)?;
                if open.inode == inode {
                    open
                } else {
                    self.open_at(0)?
                }
            }
            None => {
                let len = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
                self.open_at(len)?
            }
        };

        log::info!(
            "source {}: tailing {} from offset {}",
            self.name,
            self.path.display(),
            open.offset
        );

        let mut coalescer = Coalescer::new();
        let mut line = String::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            // rotation check: new inode or a shrunken file means reopen
            match std::fs::metadata(&self.path) {
                Ok(metadata) => {
                    let inode = Self::inode_of(&metadata);
                    if inode != open.inode || metadata.len() < open.offset {
                        log::info!("source {}: rotation detected, reopening", self.name);
                        open = self.open_at(0)?;
                    }
                }
                Err(_) => {
                    // rotated away and not recreated yet
                    tokio::time::sleep(constants::TAIL_POLL_INTERVAL).await;
                    continue;
                }
            }

            let mut read_any = false;
            loop {
                line.clear();
                let n = open.reader.read_line(&mut line)?;
                if n == 0 {
                    break;
                }
                if !line.ends_with('\n') {
                    // partial write; rewind and retry next poll
                    open.reader.seek(SeekFrom::Start(open.offset))?;
                    break;
                }
                open.offset += n as u64;
                read_any = true;
                if let Some((ready, repeats)) = coalescer.offer(line.trim_end().to_string()) {
                    self.emit(ctx, &ready, repeats);
                }
            }

            if let Some((ready, repeats)) = coalescer.flush_stale() {
                self.emit(ctx, &ready, repeats);
            }

            if read_any {
                ctx.store
                    .set_state(&self.cursor_key(), &format_cursor(open.inode, open.offset))
                    .await?;
            }

            tokio::select! {
                _ = tokio::time::sleep(constants::TAIL_POLL_INTERVAL) => {}
                _ = shutdown.changed() => {}
            }
        }

        // persist final position on graceful drain
        ctx.store
            .set_state(&self.cursor_key(), &format_cursor(open.inode, open.offset))
            .await?;
        Ok(())
    }

    fn emit(&self, ctx: &SourceContext, line: &str, repeats: u64) {
        let Some(mut event) = self.parser.parse(&self.name, line) else {
            return;
        };
        if repeats > 1 {
            event.raw = format!("{} (x{})", event.raw, repeats);
        }
        ctx.bus.publish(event);
    }
}

fn format_cursor(inode: u64, offset: u64) -> String {
    format!("{}:{}", inode, offset)
}

fn parse_cursor(value: &str) -> Option<(u64, u64)> {
    let (inode, offset) = value.split_once(':')?;
    Some((inode.parse().ok()?, offset.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trip() {
        let text = format_cursor(1234, 5678);
        assert_eq!(parse_cursor(&text), Some((1234, 5678)));
        assert_eq!(parse_cursor("garbage"), None);
    }

    #[test]
    fn coalescer_counts_repeats() {
        let mut c = Coalescer::new();
        assert!(c.offer("a".into()).is_none());
        assert!(c.offer("a".into()).is_none());
        assert!(c.offer("a".into()).is_none());
        // different line flushes the run
        let (line, count) = c.offer("b".into()).unwrap();
        assert_eq!(line, "a");
        assert_eq!(count, 3);
    }

    #[test]
    fn coalescer_emits_single_lines_on_change() {
        let mut c = Coalescer::new();
        assert!(c.offer("a".into()).is_none());
        let (line, count) = c.offer("b".into()).unwrap();
        assert_eq!((line.as_str(), count), ("a", 1));
    }
}
