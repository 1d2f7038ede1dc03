//! Source catalog and tabular parsing for the CPLS pipeline.

use std::path::Path;

use cpls_core::Row;
use serde::Serialize;
use tracing::warn;

pub const CRATE_NAME: &str = "cpls-adapters";

pub const HOMECARE_URL: &str = "https://www.cqc.org.uk/search/all?query=&location-query=&radius=\
&display=csv&sort=relevance&last-published=week\
&filters[]=archived:active\
&filters[]=lastPublished:all\
&filters[]=more_services:all\
&filters[]=overallRating:Not%20rated\
&filters[]=overallRating:Inadequate\
&filters[]=overallRating:Requires%20improvement\
&filters[]=services:homecare-agencies\
&filters[]=specialisms:all";

pub const CAREHOMES_URL: &str = "https://www.cqc.org.uk/search/all?query=&location-query=&radius=\
&display=csv&sort=relevance&last-published=week\
&filters[]=archived:active\
&filters[]=careHomes:all\
&filters[]=lastPublished:all\
&filters[]=more_services:all\
&filters[]=overallRating:Not%20rated\
&filters[]=overallRating:Inadequate\
&filters[]=overallRating:Requires%20improvement\
&filters[]=services:care-home\
&filters[]=specialisms:all";

/// One CSV export endpoint the pipeline pulls from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSpec {
    pub source_id: String,
    pub filename_prefix: String,
    pub url: String,
}

impl SourceSpec {
    pub fn new(source_id: &str, filename_prefix: &str, url: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            filename_prefix: filename_prefix.to_string(),
            url: url.to_string(),
        }
    }
}

pub fn homecare_source() -> SourceSpec {
    SourceSpec::new("homecare", "homecare", HOMECARE_URL)
}

pub fn carehomes_source() -> SourceSpec {
    SourceSpec::new("carehomes", "carehomes", CAREHOMES_URL)
}

/// The two weekly CQC exports, in the order they are fetched.
pub fn default_sources() -> Vec<SourceSpec> {
    vec![homecare_source(), carehomes_source()]
}

/// Parse a downloaded export into header-keyed rows.
///
/// The first record is the header. Records whose every value trims to empty
/// are discarded. A missing file degrades to an empty batch with a logged
/// warning; a malformed record stops the read and returns the rows parsed so
/// far.
pub fn parse_csv(path: &Path) -> Vec<Row> {
    let mut rows = Vec::new();

    let mut reader = match csv::ReaderBuilder::new().flexible(true).from_path(path) {
        Ok(reader) => reader,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "CSV file could not be opened for parsing");
            return rows;
        }
    };

    let headers = match reader.headers() {
        Ok(headers) => headers.clone(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "CSV header could not be read");
            return rows;
        }
    };

    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "stopping parse on malformed record");
                break;
            }
        };

        let mut row = Row::new();
        for (index, header) in headers.iter().enumerate() {
            row.insert(
                header.to_string(),
                record.get(index).unwrap_or_default().to_string(),
            );
        }
        if row.values().all(|value| value.trim().is_empty()) {
            continue;
        }
        rows.push(row);
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn csv_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp csv");
        file.write_all(contents.as_bytes()).expect("write csv");
        file
    }

    #[test]
    fn header_line_maps_column_names_to_values() {
        let file = csv_file("id,name\n1,Alice\n2,Bob\n");
        let rows = parse_csv(file.path());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id").map(String::as_str), Some("1"));
        assert_eq!(rows[0].get("name").map(String::as_str), Some("Alice"));
        assert_eq!(rows[1].get("name").map(String::as_str), Some("Bob"));
    }

    #[test]
    fn fully_blank_records_are_skipped() {
        let file = csv_file("id,name\n1,Alice\n,\n  , \n2,Bob\n");
        let rows = parse_csv(file.path());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("id").map(String::as_str), Some("2"));
    }

    #[test]
    fn short_records_leave_missing_columns_empty() {
        let file = csv_file("id,name,rating\n1,Alice\n");
        let rows = parse_csv(file.path());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("rating").map(String::as_str), Some(""));
    }

    #[test]
    fn missing_file_yields_empty_batch() {
        let rows = parse_csv(Path::new("/no/such/export.csv"));
        assert!(rows.is_empty());
    }

    #[test]
    fn default_sources_cover_both_exports() {
        let sources = default_sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].source_id, "homecare");
        assert_eq!(sources[1].source_id, "carehomes");
        assert!(sources.iter().all(|s| s.url.contains("display=csv")));
    }
}
