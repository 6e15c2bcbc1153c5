//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use rusqlite::{params, Connection};

/// Rows in the `Genes` fixture table.
pub const GENE_COUNT: u64 = 3356;

/// Rows whose `Primary_function` contains "DNA".
pub const DNA_GENE_COUNT: u64 = 1678;

const FUNCTIONS: [&str; 4] = [
    "DNA replication",
    "transport",
    "hypothetical protein",
    "DNA repair",
];

/// Gene id for row `i`.
pub fn gene_id(i: u64) -> String {
    format!("gene_{:05}", i)
}

/// Writes a pangenome-shaped database to `dir/pangenome.db`.
///
/// - `Genes(ID, "Gene Name", Primary_function, Length)`: 3356 rows, every
///   tenth gene name NULL, functions cycling through four values.
/// - `Genomes(genome_id, taxonomy)`: 3 rows.
/// - `Empty_Table(id)`: no rows.
pub fn build_fixture(dir: &Path) -> PathBuf {
    let path = dir.join("pangenome.db");
    let mut conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE Genes (
             ID TEXT NOT NULL,
             \"Gene Name\" TEXT,
             Primary_function TEXT,
             Length INTEGER
         );
         CREATE TABLE Genomes (genome_id TEXT, taxonomy TEXT);
         CREATE TABLE Empty_Table (id INTEGER);
         INSERT INTO Genomes VALUES
             ('GCF_000005845', 'Escherichia coli'),
             ('GCF_000009045', 'Bacillus subtilis'),
             ('GCF_000195955', 'Mycobacterium tuberculosis');",
    )
    .unwrap();

    let tx = conn.transaction().unwrap();
    {
        let mut stmt = tx
            .prepare("INSERT INTO Genes VALUES (?1, ?2, ?3, ?4)")
            .unwrap();
        for i in 0..GENE_COUNT {
            let name = (i % 10 != 0).then(|| format!("gn{}", i));
            let function = FUNCTIONS[(i % 4) as usize];
            let length = 300 + (i * 37) % 2000;
            stmt.execute(params![gene_id(i), name, function, length as i64])
                .unwrap();
        }
    }
    tx.commit().unwrap();
    path
}

/// Sets a directory's mtime `by` into the past.
pub fn age(path: &Path, by: Duration) {
    std::fs::File::open(path)
        .unwrap()
        .set_modified(SystemTime::now() - by)
        .unwrap();
}
