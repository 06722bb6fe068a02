use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use prettytable::{format, row, Table};

use crate::store::{Record, RecordId};
use crate::util::{verify_filename, HumanMemory, HumanSeconds};

/// Writes one CSV row per record, in the given order. Columns follow the
/// [`Record`] fields.
pub fn write_csv(records: &[(RecordId, Record)], path: &Path) -> anyhow::Result<()> {
    verify_filename(path)?;

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Unable to create CSV report {path:?}"))?;

    for (id, record) in records {
        writer
            .serialize(record)
            .with_context(|| format!("Unable to write record {id} to {path:?}"))?;
    }

    writer
        .flush()
        .with_context(|| format!("Unable to flush CSV report {path:?}"))?;

    Ok(())
}

#[must_use]
pub fn summary_table(records: &[(RecordId, Record)]) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
    table.set_titles(row![
        "ID", "Scheme", "Source", "Elapsed", "CPU", "Max RSS", "Speed", "VMAF", "PSNR", "MS-SSIM"
    ]);

    for (id, record) in records {
        let cpu = if record.elapsed > 0.0 {
            (record.system_time + record.user_time) / record.elapsed * 100.0
        } else {
            0.0
        };

        table.add_row(row![
            r->id,
            record.name,
            record.source_file.display(),
            r->HumanSeconds(Duration::from_secs_f64(record.elapsed.max(0.0))),
            r->format!("{cpu:.0}%"),
            r->HumanMemory(record.max_rss),
            r->format!("{:.2}x", record.avg_encoding_speed),
            r->format!("{:.3}", record.vmaf_mean),
            r->format!("{:.3}", record.psnr_mean),
            r->format!("{:.5}", record.ms_ssim_mean)
        ]);
    }

    table
}

#[allow(clippy::print_stdout)]
pub fn print_summary(records: &[(RecordId, Record)]) {
    if records.is_empty() {
        println!("No successful encodes to report.");
        return;
    }

    summary_table(records).printstd();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::path::PathBuf;

    fn records() -> Vec<(RecordId, Record)> {
        let store = Store::new();

        for (name, vmaf) in [("fast", 91.25), ("slow", 95.5)] {
            store.insert(Record {
                name: name.to_owned(),
                source_file: PathBuf::from("clip.mp4"),
                elapsed: 2.0,
                user_time: 3.0,
                max_rss: 2048,
                vmaf_mean: vmaf,
                ..Record::default()
            });
        }

        store.sorted_records()
    }

    #[test]
    fn csv_has_a_header_and_one_row_per_record() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("nested").join("report.csv");

        write_csv(&records(), &path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.get(0), Some("name"));
        assert!(headers.iter().any(|header| header == "vmaf_harmonic_mean"));

        let rows: Vec<_> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get(0), Some("slow"));

        let vmaf_column = headers.iter().position(|header| header == "vmaf_mean").unwrap();
        assert_eq!(rows[0].get(vmaf_column), Some("91.25"));
    }

    #[test]
    fn summary_has_one_row_per_record() {
        let table = summary_table(&records());

        assert_eq!(table.len(), 2);
        let rendered = table.to_string();
        assert!(rendered.contains("2.0 MiB"));
        assert!(rendered.contains("150%"));
    }
}
