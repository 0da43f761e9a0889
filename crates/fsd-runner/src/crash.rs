//! Process-wide crash reporting.
//!
//! The first crash observed in a process carries the child's stderr tail.
//! Later crashes only point back at it, so a suite where every case dies the
//! same way does not repeat the same multi-kilobyte trace per case.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Bytes of child stderr embedded in the first crash report.
pub const CRASH_TAIL_BYTES: usize = 65_536;

const DIGEST_PREFIX_BYTES: usize = 6;

static GLOBAL_LEDGER: LazyLock<CrashReportLedger> = LazyLock::new(CrashReportLedger::default);

/// The last `limit` bytes of `stderr`, never splitting a UTF-8 sequence.
#[must_use]
pub fn stderr_tail(stderr: &str, limit: usize) -> &str {
    if stderr.len() <= limit {
        return stderr;
    }
    let mut start = stderr.len() - limit;
    while !stderr.is_char_boundary(start) {
        start += 1;
    }
    &stderr[start..]
}

#[derive(Debug, Clone)]
struct FirstReport {
    stage: String,
    digest: String,
}

#[derive(Debug, Default)]
struct LedgerState {
    reports: u64,
    first: Option<FirstReport>,
}

#[derive(Debug, Default)]
pub struct CrashReportLedger {
    state: Mutex<LedgerState>,
}

impl CrashReportLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The ledger shared by every gate in this process.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL_LEDGER
    }

    /// Number of crash reports issued so far.
    #[must_use]
    pub fn reports(&self) -> u64 {
        self.state.lock().reports
    }

    /// Record a crash of `stage` and build the message to surface for it.
    pub fn report(&self, stage: &str, exit_code: i32, stderr: &str) -> String {
        let mut state = self.state.lock();
        let ordinal = state.reports;
        state.reports += 1;

        if let Some(first) = &state.first {
            return format!(
                "stage `{stage}` panicked (exit code {exit_code}); crash report #{} suppressed, \
                 see report {} from stage `{}` for the stderr tail",
                ordinal + 1,
                first.digest,
                first.stage
            );
        }

        let tail = stderr_tail(stderr, CRASH_TAIL_BYTES);
        let digest = short_digest(tail);
        state.first = Some(FirstReport {
            stage: stage.to_owned(),
            digest: digest.clone(),
        });
        format!(
            "stage `{stage}` panicked (exit code {exit_code}) [report {digest}]. \
             stderr tail:\n{tail}"
        )
    }
}

fn short_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    bytes_to_hex(&digest[..DIGEST_PREFIX_BYTES])
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    const HEX_LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_LUT[(byte >> 4) as usize] as char);
        out.push(HEX_LUT[(byte & 0x0f) as usize] as char);
    }
    out
}
