use std::num::ParseIntError;

const TABLE_TOTAL_MARKER: &str = "Total";
const TABLE_UPTIME_MARKER: &str = "Uptime";
const WINDOWED_MARKER: &str = "gpu[*]:";
const UNAVAILABLE: &str = "N/A";

/// Result of inspecting a single log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Line does not carry any recognized rate pattern
    NoMetric,
    /// Rate successfully extracted
    Value(u64),
    /// Line is recognized but explicitly reports that no rate is available
    Unavailable,
    /// Line is recognized but its rate field is not a valid unsigned integer
    Malformed { line: String, cause: ParseIntError },
}

/// Extract proof rate from a line of miner dashboard output.
///
/// Two layouts are recognized:
///
/// * summary rows of the pipe table, identified by `Total` and `Uptime`. Rate is the third
/// `|`-delimited column.
/// * aggregate rows identified by `gpu[*]:`. When the row uses windowed figures
/// (`(1m - N   5m - N ...)`), rate is the one-minute figure, otherwise it is the fifth
/// whitespace-delimited token following the marker.
///
/// ```rust
/// # use prooftail::{parse, ParseOutcome};
/// let line = "|  Total | 935755    | 0     |             |                    | Uptime  68415s           |";
/// assert_eq!(parse(line), ParseOutcome::Value(935755));
/// assert_eq!(parse("unrelated output"), ParseOutcome::NoMetric);
/// ```
pub fn parse(line: &str) -> ParseOutcome {
    let candidate = if line.contains(TABLE_TOTAL_MARKER) && line.contains(TABLE_UPTIME_MARKER) {
        table_candidate(line)
    } else if let Some(start) = line.find(WINDOWED_MARKER) {
        windowed_candidate(&line[start + WINDOWED_MARKER.len()..])
    } else {
        return ParseOutcome::NoMetric;
    };

    match candidate {
        "" => ParseOutcome::NoMetric,
        UNAVAILABLE => ParseOutcome::Unavailable,
        raw => match raw.parse::<u64>() {
            Ok(value) => ParseOutcome::Value(value),
            Err(cause) => ParseOutcome::Malformed {
                line: line.to_string(),
                cause,
            },
        },
    }
}

fn table_candidate(line: &str) -> &str {
    line.split('|').nth(2).map(str::trim).unwrap_or_default()
}

/// Tokens are counted from the marker, not from the start of the line: `| gpu[*]: 10 20 30 40 50` yields `50`.
fn windowed_candidate(rest: &str) -> &str {
    let mut fields = rest.split_whitespace().peekable();
    let windowed = fields.peek().is_some_and(|first| first.starts_with('('));
    let candidate = if windowed {
        // `(1m - N` : value follows the first separator
        fields.skip_while(|field| *field != "-").nth(1)
    } else {
        fields.nth(4)
    };
    candidate.unwrap_or_default()
}
