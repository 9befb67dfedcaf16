//! Coordinator tests: spool file contents, worker-count independence,
//! bad-entry tolerance and cancellation cleanup.

mod common;

use common::{corpus, entry_xml, invalid_entry_xml, read_spool, write_gz};
use upl_core::model::Profile;
use upl_core::schema;
use upl_core::transform::{transform_to_spool, CancelToken, TransformOptions};

fn options(workers: usize) -> TransformOptions {
    TransformOptions {
        workers,
        queue_depth: workers * 2,
        profile: Profile::Full,
    }
}

fn sample_corpus(n: usize) -> String {
    let entries: Vec<String> = (0..n)
        .map(|i| {
            entry_xml(
                &format!("P{:05}", i + 1),
                &format!("Q{:05}", i + 1),
                &format!("GENE{}", i + 1),
                "2024-07-17",
            )
        })
        .collect();
    corpus("2024_03", &entries)
}

#[test]
fn spool_files_carry_all_tables() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("uniprot_sprot.xml.gz");
    write_gz(&input, &sample_corpus(2));
    let spool_dir = dir.path().join("spool");

    let report =
        transform_to_spool(&input, &spool_dir, &options(2), &CancelToken::new()).unwrap();

    assert_eq!(report.release.as_deref(), Some("2024_03"));
    assert_eq!(report.entries, 2);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.rows[schema::PROTEINS], 2);
    assert_eq!(report.rows[schema::GENES], 2);
    assert_eq!(report.rows[schema::PROTEIN_TO_GO], 2);
    assert_eq!(report.rows[schema::ACCESSIONS], 2);
    // Both entries share an organism; the writer deduplicates it.
    assert_eq!(report.rows[schema::TAXONOMY], 1);

    let proteins = read_spool(&spool_dir.join(schema::spool_file_name(schema::PROTEINS)));
    assert_eq!(proteins.len(), 2);
    let mut accessions: Vec<_> = proteins
        .iter()
        .map(|row| row[0].clone().unwrap())
        .collect();
    accessions.sort();
    assert_eq!(accessions, vec!["P00001", "P00002"]);

    let taxonomy = read_spool(&spool_dir.join(schema::spool_file_name(schema::TAXONOMY)));
    assert_eq!(taxonomy.len(), 1);
    assert_eq!(taxonomy[0][0].as_deref(), Some("9606"));
    assert_eq!(taxonomy[0][2].as_deref(), Some("Eukaryota; Metazoa"));
}

#[test]
fn worker_count_does_not_change_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("uniprot_sprot.xml.gz");
    write_gz(&input, &sample_corpus(20));

    let spool_single = dir.path().join("spool-single");
    let spool_parallel = dir.path().join("spool-parallel");
    transform_to_spool(&input, &spool_single, &options(1), &CancelToken::new()).unwrap();
    transform_to_spool(&input, &spool_parallel, &options(4), &CancelToken::new()).unwrap();

    for table in schema::data_tables() {
        let file = schema::spool_file_name(table.name);
        let single_path = spool_single.join(&file);
        let parallel_path = spool_parallel.join(&file);
        assert_eq!(
            single_path.exists(),
            parallel_path.exists(),
            "spool presence differs for {}",
            table.name
        );
        if !single_path.exists() {
            continue;
        }
        let mut single = read_spool(&single_path);
        let mut parallel = read_spool(&parallel_path);
        single.sort();
        parallel.sort();
        assert_eq!(single, parallel, "rows differ for {}", table.name);
    }
}

#[test]
fn malformed_entries_are_counted_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("uniprot_sprot.xml.gz");
    let mut entries: Vec<String> = (0..10)
        .map(|i| {
            entry_xml(
                &format!("P{:05}", i + 1),
                &format!("Q{:05}", i + 1),
                &format!("GENE{}", i + 1),
                "2024-07-17",
            )
        })
        .collect();
    entries[4] = invalid_entry_xml();
    write_gz(&input, &corpus("2024_03", &entries));
    let spool_dir = dir.path().join("spool");

    let report =
        transform_to_spool(&input, &spool_dir, &options(2), &CancelToken::new()).unwrap();

    assert_eq!(report.entries, 9);
    assert_eq!(report.skipped, 1);
    let proteins = read_spool(&spool_dir.join(schema::spool_file_name(schema::PROTEINS)));
    assert_eq!(proteins.len(), 9);
}

#[test]
fn cancellation_deletes_spool_files() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("uniprot_sprot.xml.gz");
    write_gz(&input, &sample_corpus(50));
    let spool_dir = dir.path().join("spool");

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = transform_to_spool(&input, &spool_dir, &options(2), &cancel).unwrap_err();

    assert!(matches!(err, upl_core::EtlError::Cancelled));
    assert!(!spool_dir.exists());
}

#[test]
fn empty_input_produces_no_spool_files() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("uniprot_sprot.xml.gz");
    write_gz(&input, "");
    let spool_dir = dir.path().join("spool");

    let report =
        transform_to_spool(&input, &spool_dir, &options(2), &CancelToken::new()).unwrap();

    assert_eq!(report.entries, 0);
    assert!(report.rows.is_empty());
    let leftover: Vec<_> = std::fs::read_dir(&spool_dir).unwrap().collect();
    assert!(leftover.is_empty());
}

#[test]
fn standard_profile_masks_spooled_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("uniprot_sprot.xml.gz");
    write_gz(&input, &sample_corpus(1));
    let spool_dir = dir.path().join("spool");

    let opts = TransformOptions {
        profile: Profile::Standard,
        ..options(2)
    };
    transform_to_spool(&input, &spool_dir, &opts, &CancelToken::new()).unwrap();

    let proteins = read_spool(&spool_dir.join(schema::spool_file_name(schema::PROTEINS)));
    let row = &proteins[0];
    // function comment survives, the other payloads are nulled
    assert!(row[8].as_deref().unwrap_or("").contains("function"));
    assert!(row[9].is_none());
    assert!(row[10].is_none());
    assert!(row[11].is_none());
}
