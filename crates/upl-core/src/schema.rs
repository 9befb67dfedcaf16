//! Schema catalog
//!
//! Declarative definitions of every target table: ordered columns with
//! SQL types, primary keys, foreign keys, post-load indexes and the merge
//! strategy used by delta loads. The catalog order is parents-first and
//! doubles as the bulk-load and merge order. Adapters emit DDL from these
//! definitions instead of carrying their own SQL templates.

/// Table names, kept in one place so the encoder, the writer and the
/// executor cannot drift apart.
pub const TAXONOMY: &str = "taxonomy";
pub const PROTEINS: &str = "proteins";
pub const SEQUENCES: &str = "sequences";
pub const ACCESSIONS: &str = "accessions";
pub const GENES: &str = "genes";
pub const KEYWORDS: &str = "keywords";
pub const PROTEIN_TO_GO: &str = "protein_to_go";
pub const PROTEIN_TO_TAXONOMY: &str = "protein_to_taxonomy";
pub const RELEASE_METADATA: &str = "py_load_uniprot_metadata";
pub const LOAD_HISTORY: &str = "load_history";

/// A single column with its SQL type.
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub sql_type: &'static str,
}

/// A foreign key declared inside the owning schema, so schema renames
/// stay self-contained.
#[derive(Debug, Clone, Copy)]
pub struct ForeignKey {
    pub columns: &'static [&'static str],
    pub references: &'static str,
    pub ref_columns: &'static [&'static str],
    pub on_delete_cascade: bool,
}

/// Post-load index kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    BTree,
    Gin,
}

/// A post-load index on a single column.
#[derive(Debug, Clone, Copy)]
pub struct IndexDef {
    pub column: &'static str,
    pub kind: IndexKind,
}

/// How a delta load merges the staged table into production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Insert-or-update on the primary key.
    Upsert,
    /// The table models a set of relations per protein: delete all
    /// production rows whose protein appears in staging, then insert the
    /// staged rows. Set membership can shrink as well as grow.
    ReplaceByProtein,
    /// Bookkeeping table maintained by the metadata registry, never
    /// bulk-loaded or merged.
    Metadata,
}

/// Complete definition of one target table.
#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    pub primary_key: &'static [&'static str],
    pub foreign_keys: &'static [ForeignKey],
    pub indexes: &'static [IndexDef],
    pub merge: MergeStrategy,
}

impl TableDef {
    /// Ordered column names, matching spool file field order.
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }

    /// Columns outside the primary key; the updatable set for upserts.
    pub fn non_key_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns
            .iter()
            .map(|c| c.name)
            .filter(|name| !self.primary_key.contains(name))
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for this table inside the
    /// given schema.
    pub fn create_sql(&self, schema: &str) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.sql_type))
            .collect();
        parts.push(format!("PRIMARY KEY ({})", self.primary_key.join(", ")));
        for fk in self.foreign_keys {
            let mut clause = format!(
                "FOREIGN KEY ({}) REFERENCES {}.{} ({})",
                fk.columns.join(", "),
                schema,
                fk.references,
                fk.ref_columns.join(", ")
            );
            if fk.on_delete_cascade {
                clause.push_str(" ON DELETE CASCADE");
            }
            parts.push(clause);
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {}.{} ({})",
            schema,
            self.name,
            parts.join(", ")
        )
    }

    /// `CREATE INDEX` statements for this table inside the given schema.
    pub fn index_sql(&self, schema: &str) -> Vec<String> {
        self.indexes
            .iter()
            .map(|ix| {
                let using = match ix.kind {
                    IndexKind::BTree => "",
                    IndexKind::Gin => " USING gin",
                };
                format!(
                    "CREATE INDEX IF NOT EXISTS ix_{}_{} ON {}.{}{} ({})",
                    self.name, ix.column, schema, self.name, using, ix.column
                )
            })
            .collect()
    }
}

/// All target tables, parents first. This order is the bulk-load order
/// and the delta-merge order.
pub static TABLES: &[TableDef] = &[
    TableDef {
        name: TAXONOMY,
        columns: &[
            ColumnDef { name: "ncbi_taxid", sql_type: "BIGINT" },
            ColumnDef { name: "scientific_name", sql_type: "TEXT" },
            ColumnDef { name: "lineage", sql_type: "TEXT" },
        ],
        primary_key: &["ncbi_taxid"],
        foreign_keys: &[],
        indexes: &[],
        merge: MergeStrategy::Upsert,
    },
    TableDef {
        name: PROTEINS,
        columns: &[
            ColumnDef { name: "primary_accession", sql_type: "TEXT" },
            ColumnDef { name: "uniprot_id", sql_type: "TEXT" },
            ColumnDef { name: "protein_name", sql_type: "TEXT" },
            ColumnDef { name: "ncbi_taxid", sql_type: "BIGINT" },
            ColumnDef { name: "sequence_length", sql_type: "INTEGER" },
            ColumnDef { name: "molecular_weight", sql_type: "INTEGER" },
            ColumnDef { name: "created_date", sql_type: "DATE" },
            ColumnDef { name: "modified_date", sql_type: "DATE" },
            ColumnDef { name: "comments_data", sql_type: "JSONB" },
            ColumnDef { name: "features_data", sql_type: "JSONB" },
            ColumnDef { name: "db_references_data", sql_type: "JSONB" },
            ColumnDef { name: "evidence_data", sql_type: "JSONB" },
        ],
        primary_key: &["primary_accession"],
        foreign_keys: &[ForeignKey {
            columns: &["ncbi_taxid"],
            references: TAXONOMY,
            ref_columns: &["ncbi_taxid"],
            on_delete_cascade: false,
        }],
        indexes: &[
            IndexDef { column: "uniprot_id", kind: IndexKind::BTree },
            IndexDef { column: "comments_data", kind: IndexKind::Gin },
            IndexDef { column: "features_data", kind: IndexKind::Gin },
            IndexDef { column: "db_references_data", kind: IndexKind::Gin },
        ],
        merge: MergeStrategy::Upsert,
    },
    TableDef {
        name: SEQUENCES,
        columns: &[
            ColumnDef { name: "primary_accession", sql_type: "TEXT" },
            ColumnDef { name: "sequence", sql_type: "TEXT" },
        ],
        primary_key: &["primary_accession"],
        foreign_keys: &[ForeignKey {
            columns: &["primary_accession"],
            references: PROTEINS,
            ref_columns: &["primary_accession"],
            on_delete_cascade: true,
        }],
        indexes: &[],
        merge: MergeStrategy::Upsert,
    },
    TableDef {
        name: ACCESSIONS,
        columns: &[
            ColumnDef { name: "protein_accession", sql_type: "TEXT" },
            ColumnDef { name: "secondary_accession", sql_type: "TEXT" },
        ],
        primary_key: &["protein_accession", "secondary_accession"],
        foreign_keys: &[ForeignKey {
            columns: &["protein_accession"],
            references: PROTEINS,
            ref_columns: &["primary_accession"],
            on_delete_cascade: true,
        }],
        indexes: &[IndexDef { column: "secondary_accession", kind: IndexKind::BTree }],
        merge: MergeStrategy::ReplaceByProtein,
    },
    TableDef {
        name: GENES,
        columns: &[
            ColumnDef { name: "protein_accession", sql_type: "TEXT" },
            ColumnDef { name: "gene_name", sql_type: "TEXT" },
            ColumnDef { name: "is_primary", sql_type: "BOOLEAN" },
        ],
        primary_key: &["protein_accession", "gene_name"],
        foreign_keys: &[ForeignKey {
            columns: &["protein_accession"],
            references: PROTEINS,
            ref_columns: &["primary_accession"],
            on_delete_cascade: true,
        }],
        indexes: &[IndexDef { column: "gene_name", kind: IndexKind::BTree }],
        merge: MergeStrategy::ReplaceByProtein,
    },
    TableDef {
        name: KEYWORDS,
        columns: &[
            ColumnDef { name: "protein_accession", sql_type: "TEXT" },
            ColumnDef { name: "keyword_id", sql_type: "TEXT" },
            ColumnDef { name: "keyword_label", sql_type: "TEXT" },
        ],
        primary_key: &["protein_accession", "keyword_id"],
        foreign_keys: &[ForeignKey {
            columns: &["protein_accession"],
            references: PROTEINS,
            ref_columns: &["primary_accession"],
            on_delete_cascade: true,
        }],
        indexes: &[IndexDef { column: "keyword_label", kind: IndexKind::BTree }],
        merge: MergeStrategy::ReplaceByProtein,
    },
    TableDef {
        name: PROTEIN_TO_GO,
        columns: &[
            ColumnDef { name: "protein_accession", sql_type: "TEXT" },
            ColumnDef { name: "go_term_id", sql_type: "TEXT" },
        ],
        primary_key: &["protein_accession", "go_term_id"],
        foreign_keys: &[ForeignKey {
            columns: &["protein_accession"],
            references: PROTEINS,
            ref_columns: &["primary_accession"],
            on_delete_cascade: true,
        }],
        indexes: &[IndexDef { column: "go_term_id", kind: IndexKind::BTree }],
        merge: MergeStrategy::ReplaceByProtein,
    },
    TableDef {
        name: PROTEIN_TO_TAXONOMY,
        columns: &[
            ColumnDef { name: "protein_accession", sql_type: "TEXT" },
            ColumnDef { name: "ncbi_taxid", sql_type: "BIGINT" },
        ],
        primary_key: &["protein_accession", "ncbi_taxid"],
        foreign_keys: &[
            ForeignKey {
                columns: &["protein_accession"],
                references: PROTEINS,
                ref_columns: &["primary_accession"],
                on_delete_cascade: true,
            },
            ForeignKey {
                columns: &["ncbi_taxid"],
                references: TAXONOMY,
                ref_columns: &["ncbi_taxid"],
                on_delete_cascade: false,
            },
        ],
        indexes: &[IndexDef { column: "ncbi_taxid", kind: IndexKind::BTree }],
        merge: MergeStrategy::ReplaceByProtein,
    },
    TableDef {
        name: RELEASE_METADATA,
        columns: &[
            ColumnDef { name: "version", sql_type: "TEXT" },
            ColumnDef { name: "release_date", sql_type: "DATE" },
            ColumnDef { name: "load_timestamp", sql_type: "TIMESTAMPTZ" },
            ColumnDef { name: "swissprot_entry_count", sql_type: "BIGINT" },
            ColumnDef { name: "trembl_entry_count", sql_type: "BIGINT" },
        ],
        primary_key: &["version"],
        foreign_keys: &[],
        indexes: &[],
        merge: MergeStrategy::Metadata,
    },
    TableDef {
        name: LOAD_HISTORY,
        columns: &[
            ColumnDef { name: "id", sql_type: "BIGINT GENERATED BY DEFAULT AS IDENTITY" },
            ColumnDef { name: "run_id", sql_type: "UUID NOT NULL UNIQUE" },
            ColumnDef { name: "status", sql_type: "TEXT NOT NULL" },
            ColumnDef { name: "mode", sql_type: "TEXT" },
            ColumnDef { name: "dataset", sql_type: "TEXT" },
            ColumnDef { name: "start_time", sql_type: "TIMESTAMPTZ" },
            ColumnDef { name: "end_time", sql_type: "TIMESTAMPTZ" },
            ColumnDef { name: "error_message", sql_type: "TEXT" },
        ],
        primary_key: &["id"],
        foreign_keys: &[],
        indexes: &[],
        merge: MergeStrategy::Metadata,
    },
];

/// Tables filled by the transform stage, in load order.
pub fn data_tables() -> impl Iterator<Item = &'static TableDef> {
    TABLES.iter().filter(|t| t.merge != MergeStrategy::Metadata)
}

/// Look up a table definition by name.
pub fn table(name: &str) -> Option<&'static TableDef> {
    TABLES.iter().find(|t| t.name == name)
}

/// Spool file name for a table.
pub fn spool_file_name(table: &str) -> String {
    format!("{table}.tsv.gz")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_parents_first() {
        let pos = |name: &str| TABLES.iter().position(|t| t.name == name).unwrap();
        assert!(pos(TAXONOMY) < pos(PROTEINS));
        for child in [SEQUENCES, ACCESSIONS, GENES, KEYWORDS, PROTEIN_TO_GO, PROTEIN_TO_TAXONOMY] {
            assert!(pos(PROTEINS) < pos(child), "{child} must come after proteins");
        }
    }

    #[test]
    fn foreign_keys_reference_earlier_tables() {
        let pos = |name: &str| TABLES.iter().position(|t| t.name == name).unwrap();
        for t in TABLES {
            for fk in t.foreign_keys {
                assert!(
                    pos(fk.references) < pos(t.name),
                    "{} references {} before it is created",
                    t.name,
                    fk.references
                );
            }
        }
    }

    #[test]
    fn create_sql_is_schema_qualified() {
        let sql = table(GENES).unwrap().create_sql("uniprot_staging_2024_01");
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS uniprot_staging_2024_01.genes"));
        assert!(sql.contains("PRIMARY KEY (protein_accession, gene_name)"));
        assert!(sql.contains(
            "REFERENCES uniprot_staging_2024_01.proteins (primary_accession) ON DELETE CASCADE"
        ));
    }

    #[test]
    fn proteins_has_gin_indexes_on_json_columns() {
        let stmts = table(PROTEINS).unwrap().index_sql("s");
        assert_eq!(stmts.len(), 4);
        assert!(stmts.iter().any(|s| s.contains("USING gin (comments_data)")));
        assert!(stmts.iter().any(|s| !s.contains("gin") && s.contains("(uniprot_id)")));
    }

    #[test]
    fn upsert_tables_have_updatable_columns() {
        let proteins = table(PROTEINS).unwrap();
        let non_key: Vec<_> = proteins.non_key_columns().collect();
        assert!(!non_key.contains(&"primary_accession"));
        assert!(non_key.contains(&"modified_date"));
    }

    #[test]
    fn metadata_tables_are_not_data_tables() {
        let names: Vec<_> = data_tables().map(|t| t.name).collect();
        assert!(!names.contains(&RELEASE_METADATA));
        assert!(!names.contains(&LOAD_HISTORY));
        assert_eq!(names.len(), 8);
    }
}
