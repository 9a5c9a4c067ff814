mod common;

use supply_qa::security::sql_validator::{SqlValidator, ValidationVerdict};

const ROW_CAP: u64 = 500;

fn validator() -> SqlValidator {
    SqlValidator::new(common::allowlist(), ROW_CAP)
}

fn case_variants(sql: &str) -> Vec<String> {
    let mixed: String = sql
        .chars()
        .enumerate()
        .map(|(i, c)| if i % 2 == 0 { c.to_ascii_uppercase() } else { c.to_ascii_lowercase() })
        .collect();
    vec![sql.to_string(), sql.to_uppercase(), sql.to_lowercase(), mixed]
}

const WRITES: &[&str] = &[
    "DROP TABLE gold_inventory",
    "DELETE FROM gold_inventory WHERE site_id = 'SITE-001'",
    "UPDATE gold_inventory SET quantity_available = 0",
    "INSERT INTO gold_clinical_sites (site_id, site_name, country) VALUES ('x', 'y', 'z')",
    "TRUNCATE gold_inventory",
    "ALTER TABLE gold_inventory ADD COLUMN note TEXT",
    "CREATE TABLE stolen AS SELECT * FROM gold_inventory",
    "GRANT SELECT ON gold_inventory TO public",
    "SELECT site_id FROM gold_inventory FOR UPDATE",
    "SELECT site_id INTO copy_of_sites FROM gold_clinical_sites",
    "SELECT pg_sleep(10)",
];

const READS: &[&str] = &[
    "SELECT site_id, quantity_available FROM gold_inventory WHERE quantity_available < 10",
    "SELECT country, COUNT(*) AS sites FROM gold_clinical_sites GROUP BY country",
    "SELECT s.site_name, i.quantity_available FROM gold_inventory i JOIN gold_clinical_sites s ON s.site_id = i.site_id",
    "SELECT product_id, days_until_expiry FROM gold_inventory WHERE days_until_expiry < 90 ORDER BY days_until_expiry",
    "WITH low AS (SELECT site_id FROM gold_inventory WHERE quantity_available < 10) SELECT COUNT(*) FROM low",
];

#[test]
fn test_writes_never_accepted_in_any_form() {
    let validator = validator();
    for write in WRITES {
        let standalone = case_variants(write);
        let chained = case_variants(&format!("SELECT site_id FROM gold_inventory; {}", write));
        let wrapped = vec![format!("  \n{};  ", write), format!("/* report */ {}", write)];

        for sql in standalone.iter().chain(&chained).chain(&wrapped) {
            assert!(
                !validator.validate(sql).is_accepted(),
                "accepted a write: {}",
                sql
            );
        }
    }
}

#[test]
fn test_reads_accepted_and_capped() {
    let validator = validator();
    for read in READS {
        for limit in ["", " LIMIT 1", " LIMIT 500", " LIMIT 100000"] {
            for sql in case_variants(&format!("{}{}", read, limit)) {
                match validator.validate(&sql) {
                    ValidationVerdict::Accepted(q) => {
                        assert!(q.limit() >= 1 && q.limit() <= ROW_CAP, "{} -> {}", sql, q.limit());
                        assert!(q.sql().to_uppercase().contains(&format!("LIMIT {}", q.limit())));
                        assert!(!q.tables().is_empty());
                    }
                    ValidationVerdict::Rejected { reason, .. } => {
                        panic!("rejected a safe read {}: {}", sql, reason)
                    }
                }
            }
        }
    }
}

#[test]
fn test_commented_out_write_cannot_survive() {
    let validator = validator();
    let sql = "SELECT site_id FROM gold_inventory -- ; DROP TABLE gold_inventory";
    if let ValidationVerdict::Accepted(q) = validator.validate(sql) {
        assert!(!q.sql().to_uppercase().contains("DROP"));
        assert!(q.sql().contains("LIMIT 500"));
    }
}

#[test]
fn test_unknown_names_rejected_regardless_of_case() {
    let validator = validator();
    for sql in [
        "SELECT * FROM patients",
        "SELECT patient_name FROM gold_inventory",
        "SELECT i.ssn FROM gold_inventory i",
        "SELECT site_id FROM gold_inventory UNION SELECT user_id FROM pg_user",
    ] {
        for variant in case_variants(sql) {
            assert!(!validator.validate(&variant).is_accepted(), "accepted {}", variant);
        }
    }
}

#[test]
fn test_data_exporting_functions_rejected() {
    let validator = validator();
    for sql in [
        "SELECT query_to_xml('SELECT * FROM pg_shadow', true, true, '')",
        "SELECT table_to_xml('pg_authid', true, true, '')",
        "SELECT current_setting('data_directory')",
        "SELECT site_id, current_setting('is_superuser') FROM gold_inventory",
        "SELECT * FROM query_to_xml('SELECT 1', true, true, '')",
        "SELECT site_id FROM gold_inventory WHERE site_id = pg_catalog.current_setting('role')",
    ] {
        for variant in case_variants(sql) {
            assert!(!validator.validate(&variant).is_accepted(), "accepted {}", variant);
        }
    }
}

#[test]
fn test_schema_qualified_tables_must_match_allowlist_schema() {
    let validator = validator();
    for sql in [
        "SELECT * FROM secret_schema.gold_inventory",
        "SELECT quantity_available FROM public.gold_inventory",
        "SELECT i.site_id FROM gold_clinical_sites s JOIN secret_schema.gold_inventory i ON i.site_id = s.site_id",
    ] {
        for variant in case_variants(sql) {
            assert!(!validator.validate(&variant).is_accepted(), "accepted {}", variant);
        }
    }

    let scoped = SqlValidator::new(common::allowlist().with_schema("public"), ROW_CAP);
    assert!(scoped
        .validate("SELECT quantity_available FROM public.gold_inventory")
        .is_accepted());
    assert!(!scoped
        .validate("SELECT quantity_available FROM secret_schema.gold_inventory")
        .is_accepted());
}
