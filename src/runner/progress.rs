//! Incremental decoding of transfer-tool output.
//!
//! [`LineSplitter`] turns raw stream chunks into lines, treating both `\n`
//! and `\r` as terminators since progress meters rewrite the same line.
//! [`ProgressParser`] folds recognised lines into a running
//! [`TransferProgress`] and reports a new snapshot whenever it changes.

/// Prefix the transfer tool is told to print before each file name.
pub const FILE_MARKER: &str = "@file ";

/// Raw progress as decoded from the tool, before presentation rounding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferProgress {
    pub message: String,
    pub bytes_total: u64,
    pub bytes_diff_total: u64,
    pub bytes_done: f64,
    pub files_total: u64,
    pub files_diff_total: u64,
    pub files_done: u64,
    /// Fraction reported by the tool, `0..=1`.
    pub progress: f64,
    /// Bytes per second.
    pub speed: f64,
    pub seconds_left: Option<u64>,
    pub file_name: String,
    pub finished: bool,
    pub exit_code: Option<i32>,
}

/// Buffers partial output until a line terminator arrives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Flush an unterminated tail once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ProgressLine {
    bytes: u64,
    percent: f64,
    speed: f64,
    seconds_left: Option<u64>,
    to_check: Option<(u64, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stat {
    Files(u64),
    FilesTransferred(u64),
    TotalSize(u64),
    TransferredSize(u64),
}

#[derive(Debug, Clone, PartialEq)]
enum Line {
    File(String),
    Progress(ProgressLine),
    Stat(Stat),
    Other,
}

fn classify(line: &str) -> Line {
    if let Some(name) = line.strip_prefix(FILE_MARKER) {
        return Line::File(name.to_string());
    }
    if let Some(progress) = parse_progress_line(line) {
        return Line::Progress(progress);
    }
    if let Some(stat) = parse_stat_line(line) {
        return Line::Stat(stat);
    }
    Line::Other
}

fn parse_count(token: &str) -> Option<u64> {
    token.replace(',', "").parse().ok()
}

fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let mut tokens = line.split_whitespace();
    let bytes = parse_count(tokens.next()?)?;
    let percent = tokens.next()?.strip_suffix('%')?.parse::<f64>().ok()?;
    let speed = parse_rate(tokens.next()?)?;
    let seconds_left = parse_eta(tokens.next()?);

    let mut to_check = None;
    for token in tokens {
        let token = token.trim_matches(|c| c == '(' || c == ')' || c == ',');
        if let Some(counts) = token
            .strip_prefix("to-chk=")
            .or_else(|| token.strip_prefix("ir-chk="))
        {
            let (remaining, total) = counts.split_once('/')?;
            to_check = Some((parse_count(remaining)?, parse_count(total)?));
        }
    }

    Some(ProgressLine {
        bytes,
        percent,
        speed,
        seconds_left,
        to_check,
    })
}

/// Parse a rate such as `385.33kB/s` into bytes per second.
fn parse_rate(token: &str) -> Option<f64> {
    let token = token.strip_suffix("/s")?;
    let split = token.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = token.split_at(split);
    let value: f64 = number.parse().ok()?;
    let scale = match unit {
        "B" => 1.0,
        "kB" | "KB" => 1024.0,
        "MB" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(value * scale)
}

/// Parse `h:mm:ss` or `mm:ss`; anything else is an unknown estimate.
fn parse_eta(token: &str) -> Option<u64> {
    let parts: Vec<u64> = token
        .split(':')
        .map(|p| p.parse().ok())
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [h, m, s] => Some(h * 3600 + m * 60 + s),
        [m, s] => Some(m * 60 + s),
        _ => None,
    }
}

fn parse_stat_line(line: &str) -> Option<Stat> {
    let line = line.trim();
    let first = |rest: &str| rest.split_whitespace().next().and_then(parse_count);
    if let Some(rest) = line.strip_prefix("Number of regular files transferred:") {
        return first(rest).map(Stat::FilesTransferred);
    }
    if let Some(rest) = line.strip_prefix("Number of files:") {
        return first(rest).map(Stat::Files);
    }
    if let Some(rest) = line.strip_prefix("Total transferred file size:") {
        return first(rest).map(Stat::TransferredSize);
    }
    if let Some(rest) = line.strip_prefix("Total file size:") {
        return first(rest).map(Stat::TotalSize);
    }
    None
}

/// Folds tool output into progress snapshots.
#[derive(Debug, Default)]
pub struct ProgressParser {
    state: TransferProgress,
    last_emitted: Option<TransferProgress>,
    total_reported: bool,
    last_error: Option<String>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdout line. Returns a snapshot when the line changed the state.
    pub fn consume(&mut self, line: &str) -> Option<TransferProgress> {
        match classify(line) {
            Line::File(name) => self.state.file_name = name,
            Line::Progress(progress) => self.apply_progress(progress),
            Line::Stat(stat) => self.apply_stat(stat),
            Line::Other => return None,
        }
        self.emit_if_changed()
    }

    /// Remember the latest stderr line as the failure description.
    pub fn note_stderr(&mut self, line: &str) {
        let line = line.trim();
        if !line.is_empty() {
            self.last_error = Some(line.to_string());
        }
    }

    /// Build the terminal snapshot for a process that exited with `exit_code`.
    pub fn finish(&mut self, exit_code: i32) -> TransferProgress {
        let state = &mut self.state;
        state.finished = true;
        state.exit_code = Some(exit_code);
        if exit_code == 0 {
            state.message = "finished".to_string();
            state.progress = 1.0;
            state.bytes_done = state.bytes_done.max(state.bytes_total as f64);
            state.files_done = state.files_done.max(state.files_total);
            state.seconds_left = Some(0);
            state.file_name.clear();
        } else {
            state.message = self
                .last_error
                .clone()
                .unwrap_or_else(|| format!("exited with code {exit_code}"));
        }
        self.last_emitted = Some(self.state.clone());
        self.state.clone()
    }

    fn apply_progress(&mut self, line: ProgressLine) {
        let state = &mut self.state;
        state.message = "transferring".to_string();
        state.bytes_done = state.bytes_done.max(line.bytes as f64);
        state.progress = (line.percent / 100.0).clamp(0.0, 1.0);
        state.speed = line.speed;
        state.seconds_left = line.seconds_left;
        if !self.total_reported && line.percent > 0.0 {
            let estimate = (line.bytes as f64 * 100.0 / line.percent).round() as u64;
            state.bytes_total = estimate.max(line.bytes);
        }
        if let Some((remaining, total)) = line.to_check {
            state.files_total = total;
            state.files_done = state.files_done.max(total.saturating_sub(remaining));
        }
    }

    fn apply_stat(&mut self, stat: Stat) {
        let state = &mut self.state;
        match stat {
            Stat::Files(n) => state.files_total = n,
            Stat::FilesTransferred(n) => state.files_diff_total = n,
            Stat::TotalSize(n) => {
                state.bytes_total = n;
                self.total_reported = true;
            }
            Stat::TransferredSize(n) => state.bytes_diff_total = n,
        }
    }

    fn emit_if_changed(&mut self) -> Option<TransferProgress> {
        if self.last_emitted.as_ref() == Some(&self.state) {
            return None;
        }
        self.last_emitted = Some(self.state.clone());
        Some(self.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn splitter_buffers_partial_lines() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"  1,024  10%").is_empty());
        assert_eq!(splitter.push(b"  1.00kB/s\n@file a"), vec!["  1,024  10%  1.00kB/s"]);
        assert_eq!(splitter.finish(), Some("@file a".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn splitter_treats_carriage_return_as_terminator() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(b"one\rtwo\r\nthree\n");
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn parses_progress_line() {
        let line = "      1,238,099  44%  385.33kB/s    0:00:03 (xfr#2, to-chk=7/10)";
        let parsed = parse_progress_line(line).unwrap();
        assert_eq!(parsed.bytes, 1_238_099);
        assert_eq!(parsed.percent, 44.0);
        assert!((parsed.speed - 385.33 * 1024.0).abs() < 1e-6);
        assert_eq!(parsed.seconds_left, Some(3));
        assert_eq!(parsed.to_check, Some((7, 10)));
    }

    #[test]
    fn unknown_eta_is_none() {
        let parsed = parse_progress_line("0   0%    0.00B/s    ??:??:??").unwrap();
        assert_eq!(parsed.seconds_left, None);
    }

    #[test]
    fn rejects_malformed_progress() {
        assert_eq!(parse_progress_line("sending incremental file list"), None);
        assert_eq!(parse_progress_line("12 abc% 1.0kB/s 0:00:01"), None);
        assert_eq!(parse_progress_line("12 5% 1.0furlongs/s 0:00:01"), None);
        assert_eq!(parse_progress_line("12 5%"), None);
    }

    #[test]
    fn parser_tracks_counters_and_file() {
        let mut parser = ProgressParser::new();
        assert!(parser.consume("sending incremental file list").is_none());

        let snap = parser.consume("@file docs/a.txt").unwrap();
        assert_eq!(snap.file_name, "docs/a.txt");

        let snap = parser
            .consume("  500  50%  1.00kB/s  0:00:01 (xfr#1, to-chk=1/2)")
            .unwrap();
        assert_eq!(snap.bytes_done, 500.0);
        assert_eq!(snap.bytes_total, 1000);
        assert_eq!(snap.progress, 0.5);
        assert_eq!(snap.speed, 1024.0);
        assert_eq!(snap.files_total, 2);
        assert_eq!(snap.files_done, 1);
        assert_eq!(snap.seconds_left, Some(1));
    }

    #[test]
    fn parser_suppresses_unchanged_snapshots() {
        let mut parser = ProgressParser::new();
        let line = "  500  50%  1.00kB/s  0:00:01";
        assert!(parser.consume(line).is_some());
        assert!(parser.consume(line).is_none());
    }

    #[test]
    fn counters_never_decrease() {
        let mut parser = ProgressParser::new();
        parser.consume("  800  80%  1.00kB/s  0:00:01 (xfr#1, to-chk=1/5)");
        let snap = parser
            .consume("  300  30%  1.00kB/s  0:00:02 (xfr#1, to-chk=3/5)")
            .unwrap();
        assert_eq!(snap.bytes_done, 800.0);
        assert_eq!(snap.files_done, 4);
    }

    #[test]
    fn stats_override_estimates() {
        let mut parser = ProgressParser::new();
        parser.consume("  500  50%  1.00kB/s  0:00:01");
        parser.consume("Number of files: 12 (reg: 10, dir: 2)");
        parser.consume("Number of regular files transferred: 3");
        parser.consume("Total file size: 4,096 bytes");
        let snap = parser.consume("Total transferred file size: 1,500 bytes").unwrap();
        assert_eq!(snap.files_total, 12);
        assert_eq!(snap.files_diff_total, 3);
        assert_eq!(snap.bytes_total, 4096);
        assert_eq!(snap.bytes_diff_total, 1500);

        let snap = parser.consume("  600  60%  1.00kB/s  0:00:01").unwrap();
        assert_eq!(snap.bytes_total, 4096);
    }

    #[test]
    fn finish_success_completes_counters() {
        let mut parser = ProgressParser::new();
        parser.consume("@file a");
        parser.consume("  500  50%  1.00kB/s  0:00:01 (xfr#1, to-chk=1/2)");
        let last = parser.finish(0);
        assert!(last.finished);
        assert_eq!(last.exit_code, Some(0));
        assert_eq!(last.progress, 1.0);
        assert_eq!(last.bytes_done, 1000.0);
        assert_eq!(last.files_done, 2);
        assert_eq!(last.message, "finished");
        assert!(last.file_name.is_empty());
    }

    #[test]
    fn finish_failure_uses_last_stderr_line() {
        let mut parser = ProgressParser::new();
        parser.note_stderr("rsync: link_stat \"/nope\" failed: No such file or directory (2)");
        let last = parser.finish(23);
        assert_eq!(last.exit_code, Some(23));
        assert!(last.message.contains("No such file"));

        let mut silent = ProgressParser::new();
        assert_eq!(silent.finish(12).message, "exited with code 12");
    }
}
