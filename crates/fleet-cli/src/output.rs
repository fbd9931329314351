use chrono::{DateTime, Utc};
use fleet_core::lock::LockRecord;
use serde::Serialize;
use std::fmt::Display;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    print!("{}", render_table(headers, &rows));
}

/// Left-aligned columns sized to their widest cell, with a dashed rule
/// under the headers. Rows shorter than the header leave trailing cells
/// empty.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }
    let line = |cells: Vec<String>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, &w)| format!("{cell:w$}"))
            .collect();
        format!("{}\n", padded.join("  ").trim_end())
    };

    let mut out = line(headers.iter().map(|h| h.to_string()).collect());
    out.push_str(&line(widths.iter().map(|w| "-".repeat(*w)).collect()));
    for row in rows {
        out.push_str(&line(row.clone()));
    }
    out
}

/// First eight characters of an id, for tables.
pub fn short(id: &str) -> String {
    id.chars().take(8).collect()
}

pub fn or_dash<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Cluster size bounds as `min..max`, open-ended when there is no maximum.
pub fn size_bounds(min: u32, max: Option<u32>) -> String {
    match max {
        Some(max) => format!("{min}..{max}"),
        None => format!("{min}.."),
    }
}

/// Time left on a lock's lease.
pub fn lease_left(lock: &LockRecord, now: DateTime<Utc>) -> String {
    if lock.is_expired(now) {
        "expired".to_string()
    } else {
        format!("{}s", (lock.lease_expires_at - now).num_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::types::ResourceType;
    use uuid::Uuid;

    #[test]
    fn columns_fit_the_widest_cell() {
        let rows = vec![
            vec!["web".to_string(), "ACTIVE".to_string()],
            vec!["batch-workers".to_string(), "ERROR".to_string()],
        ];
        let table = render_table(&["NAME", "STATUS"], &rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "NAME           STATUS");
        assert_eq!(lines[1], "-------------  ------");
        assert_eq!(lines[2], "web            ACTIVE");
        assert_eq!(lines[3], "batch-workers  ERROR");
    }

    #[test]
    fn short_rows_do_not_pad_missing_cells() {
        let table = render_table(&["ID", "REASON"], &[vec!["a1".to_string()]]);
        assert_eq!(table.lines().nth(2), Some("a1"));
    }

    #[test]
    fn bounds_and_blanks() {
        assert_eq!(size_bounds(1, Some(5)), "1..5");
        assert_eq!(size_bounds(0, None), "0..");
        assert_eq!(or_dash(None::<String>), "-");
        assert_eq!(or_dash(Some("us-east-1a")), "us-east-1a");
    }

    #[test]
    fn lease_reports_expiry() {
        let now = Utc::now();
        let mut lock = LockRecord {
            resource_type: ResourceType::Node,
            resource_id: "n1".into(),
            holder_action: Uuid::new_v4(),
            holder_engine: "e1".into(),
            acquired_at: now,
            lease_expires_at: now + chrono::Duration::seconds(30),
        };
        assert_eq!(lease_left(&lock, now), "30s");
        lock.lease_expires_at = now - chrono::Duration::seconds(1);
        assert_eq!(lease_left(&lock, now), "expired");
    }
}
