use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use log::warn;
use serde::{Deserialize, Serialize};

use tally_common::cursor::{CursorState, PrimaryCursor};
use tally_common::raw::NewRawTransaction;

use crate::error::IngestError;
use crate::provider::ProviderError;
use crate::sources::kraken::{normalize_asset, KrakenLedgerEntry, LedgerEntryType};

pub const CSV_STREAM_TYPE: &str = "csv";
const CSV_CURSOR_OWNER: &str = "kraken_csv";

// Row shape of a Kraken "ledgers.csv" export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KrakenCsvRow {
    pub txid: String,
    pub refid: String,
    pub time: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub aclass: String,
    pub asset: String,
    pub amount: String,
    pub fee: String,
    #[serde(default)]
    pub balance: String,
}

// Collect .csv files from the account's export directories in a
// deterministic order. Directories are walked recursively; symlinked
// directories are followed once, a cycle is detected through the
// canonicalized path set.
pub fn collect_csv_files(directories: &[String]) -> Result<Vec<PathBuf>, IngestError> {
    let mut visited: HashSet<PathBuf> = HashSet::new();
    let mut pending: Vec<PathBuf> = directories.iter().map(PathBuf::from).collect();
    let mut files = Vec::new();

    while let Some(dir) = pending.pop() {
        let canonical = dir
            .canonicalize()
            .map_err(|e| IngestError::Provider(ProviderError::Io(e)))?;
        if !visited.insert(canonical.clone()) {
            warn!("skipping already visited directory {}", dir.display());
            continue;
        }

        let entries =
            std::fs::read_dir(&canonical).map_err(|e| IngestError::Provider(ProviderError::Io(e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| IngestError::Provider(ProviderError::Io(e)))?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("csv"))
                .unwrap_or(false)
            {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

fn parse_row(row: KrakenCsvRow) -> Result<KrakenLedgerEntry, String> {
    let time = NaiveDateTime::parse_from_str(&row.time, "%Y-%m-%d %H:%M:%S")
        .map_err(|e| format!("row '{}': bad time '{}': {}", row.txid, row.time, e))?;
    let entry_type: LedgerEntryType =
        serde_json::from_value(serde_json::Value::from(row.entry_type.clone()))
            .unwrap_or(LedgerEntryType::Other);

    Ok(KrakenLedgerEntry {
        id: row.txid.clone(),
        ref_id: row.refid.clone(),
        timestamp: time.and_utc().timestamp_millis() as u64,
        entry_type,
        asset: normalize_asset(&row.asset),
        amount: row.amount.clone(),
        fee: row.fee.clone(),
        balance: if row.balance.is_empty() {
            None
        } else {
            Some(row.balance.clone())
        },
    })
}

// Read one export file into raw rows. Malformed rows are tolerated and
// reported as warnings; a file that cannot be opened at all is an error.
pub fn read_ledger_file(
    path: &Path,
) -> Result<(Vec<NewRawTransaction>, Vec<String>, CursorState), IngestError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| IngestError::Provider(ProviderError::Csv(e)))?;

    let mut rows = Vec::new();
    let mut warnings = Vec::new();
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    for (line, record) in reader.deserialize::<KrakenCsvRow>().enumerate() {
        let row = match record {
            Ok(row) => row,
            Err(e) => {
                warnings.push(format!("{} line {}: {}", file_name, line + 2, e));
                continue;
            }
        };
        // some exports include unsettled entries with an empty ledger id
        if row.txid.is_empty() {
            continue;
        }

        match parse_row(row.clone()) {
            Ok(entry) => {
                let provider_data = serde_json::to_value(&row)
                    .map_err(|e| IngestError::Provider(ProviderError::Decode(e)))?;
                let normalized_data = serde_json::to_value(&entry)
                    .map_err(|e| IngestError::Provider(ProviderError::Decode(e)))?;
                rows.push(NewRawTransaction {
                    external_id: entry.id.clone(),
                    tx_hash: None,
                    provider_data,
                    normalized_data,
                    stream_type: CSV_STREAM_TYPE.to_owned(),
                });
            }
            Err(warning) => warnings.push(format!("{}: {}", file_name, warning)),
        }
    }

    let mut cursor = CursorState::new(PrimaryCursor::page_token(&file_name), CSV_CURSOR_OWNER);
    cursor.last_transaction_id = rows.last().map(|row| row.external_id.clone());
    Ok((rows, warnings, cursor))
}

// Cursor for an account whose directories hold no export files
pub fn empty_cursor() -> CursorState {
    CursorState::new(PrimaryCursor::page_token(""), CSV_CURSOR_OWNER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HEADER: &str = "txid,refid,time,type,subtype,aclass,asset,amount,fee,balance\n";

    fn write_csv(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_read_ledger_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "ledgers.csv",
            "L1,T1,2023-07-04 10:34:44,trade,,currency,XXBT,0.05,0.00000000,0.15\n\
             L2,T1,2023-07-04 10:34:44,trade,,currency,ZUSD,-1500.00,2.40,100.00\n",
        );

        let (rows, warnings, cursor) = read_ledger_file(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(warnings.is_empty());
        assert_eq!(rows[0].external_id, "L1");
        assert_eq!(rows[0].stream_type, CSV_STREAM_TYPE);
        assert_eq!(cursor.primary.value, "ledgers.csv");
        assert_eq!(cursor.last_transaction_id.as_deref(), Some("L2"));

        let entry: KrakenLedgerEntry =
            serde_json::from_value(rows[0].normalized_data.clone()).unwrap();
        assert_eq!(entry.asset, "BTC");
        assert_eq!(entry.entry_type, LedgerEntryType::Trade);
    }

    #[test]
    fn test_malformed_rows_become_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "ledgers.csv",
            "L1,T1,2023-07-04 10:34:44,deposit,,currency,ZUSD,100.00,0,100.00\n\
             L2,T2,not-a-date,deposit,,currency,ZUSD,50.00,0,150.00\n",
        );

        let (rows, warnings, _) = read_ledger_file(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("not-a-date"));
    }

    #[test]
    fn test_collect_is_recursive_sorted_and_csv_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        write_csv(dir.path(), "b.csv", "");
        write_csv(dir.path(), "a.csv", "");
        write_csv(&dir.path().join("sub"), "c.csv", "");
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

        let files =
            collect_csv_files(&[dir.path().to_string_lossy().into_owned()]).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.csv", "b.csv", "c.csv"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_cycle_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        write_csv(&sub, "a.csv", "");
        // sub/loop -> parent directory
        std::os::unix::fs::symlink(dir.path(), sub.join("loop")).unwrap();

        let files =
            collect_csv_files(&[dir.path().to_string_lossy().into_owned()]).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        assert!(collect_csv_files(&["/definitely/not/here".into()]).is_err());
    }
}
