//! Frequency histograms over the engine's result stream.
//!
//! Consumes NDJSON [`ExecResult`] records and groups them by a key —
//! captured stdout, captured stderr, exit status, or bucketed duration —
//! into [`Item`]s that can be encoded as NDJSON or a human table.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use hopper_types::ExecResult;

/// One histogram bucket: the share of all results that produced `value`,
/// and the targets that did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub freq: f64,
    pub value: String,
    pub targets: Vec<String>,
}

/// How results are grouped and ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    /// Group by captured stdout; ascending target count.
    Stdout,
    /// Group by captured stderr; ascending target count.
    Stderr,
    /// Group by exit status; ascending status.
    ExitStatus,
    /// Group by duration truncated to the bucket; ascending bucket.
    Duration(Duration),
}

impl GroupBy {
    fn key(&self, result: &ExecResult) -> String {
        match self {
            GroupBy::Stdout => result.stdout.clone(),
            GroupBy::Stderr => result.stderr.clone(),
            GroupBy::ExitStatus => result.exit_status.to_string(),
            GroupBy::Duration(bucket) => {
                let elapsed =
                    humantime::parse_duration(&result.duration).unwrap_or_default();
                humantime::format_duration(bucket_of(elapsed, *bucket)).to_string()
            }
        }
    }

    fn sort(&self, items: &mut [Item]) {
        match self {
            GroupBy::Stdout | GroupBy::Stderr => items.sort_by_key(|i| i.targets.len()),
            GroupBy::ExitStatus => {
                items.sort_by_key(|i| i.value.parse::<i64>().unwrap_or_default())
            }
            GroupBy::Duration(_) => items.sort_by_key(|i| {
                humantime::parse_duration(&i.value).unwrap_or_default()
            }),
        }
    }
}

/// The upper edge of the bucket containing `elapsed`.
fn bucket_of(elapsed: Duration, bucket: Duration) -> Duration {
    if bucket.is_zero() {
        return elapsed;
    }
    let buckets = elapsed.as_nanos() / bucket.as_nanos();
    let floor = Duration::from_nanos((buckets * bucket.as_nanos()) as u64);
    floor + bucket
}

/// Read NDJSON results from `src` and fold them into sorted Items.
///
/// Reading stops at the first line that is not a result record (a
/// truncated tail from a killed run, typically); anything collected up to
/// that point still counts. An unparseable stream with no records at all
/// is an error.
pub fn read<R: BufRead>(src: R, group: GroupBy) -> io::Result<Vec<Item>> {
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    let mut total = 0usize;

    for line in src.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let result: ExecResult = match serde_json::from_str(&line) {
            Ok(result) => result,
            Err(err) => {
                if total == 0 {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, err));
                }
                warn!("stopping at unparseable result line: {err}");
                break;
            }
        };

        total += 1;
        groups
            .entry(group.key(&result))
            .or_default()
            .push(result.target);
    }

    if total == 0 {
        return Ok(Vec::new());
    }

    let mut items: Vec<Item> = groups
        .into_iter()
        .map(|(value, targets)| Item {
            freq: to_fixed(targets.len() as f64 * 100.0 / total as f64),
            value,
            targets,
        })
        .collect();
    group.sort(&mut items);
    Ok(items)
}

/// Round to two decimal places.
fn to_fixed(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// One Item per line as JSON.
pub fn encode_json<W: Write>(w: &mut W, items: &[Item]) -> io::Result<()> {
    for item in items {
        serde_json::to_writer(&mut *w, item)?;
        writeln!(w)?;
    }
    Ok(())
}

/// A human-readable table, values over 50 bytes truncated.
pub fn encode_wide<W: Write>(w: &mut W, items: &[Item]) -> io::Result<()> {
    writeln!(w, "{:<8} {:<8} {:<8} {}", "count", "targets", "freq %", "value")?;
    for (i, item) in items.iter().enumerate() {
        let mut value = item.value.clone();
        if value.len() > 50 {
            let cut = (0..=50)
                .rev()
                .find(|&at| value.is_char_boundary(at))
                .unwrap_or(0);
            value.truncate(cut);
            value.push_str("[...]");
        }
        writeln!(
            w,
            "{:<8} {:<8} {:<6.2}   {:?}",
            i + 1,
            item.targets.len(),
            item.freq,
            value
        )?;
    }
    Ok(())
}
