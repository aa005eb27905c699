//! Shareholder register upserts and aggregation
//!
//! Every table is keyed so that replaying a batch is a no-op apart from
//! `updated_at`; concurrent batches converge on the last write.

use std::collections::HashMap;

use anyhow::Result;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::types::{FinishSummary, Holder, ShareholderRecord};

/// Collapse duplicate keys inside one batch, last row wins.
///
/// Postgres rejects an `ON CONFLICT DO UPDATE` that touches the same row twice
/// in one statement, so each table gets its own de-duplicated slice.
pub struct BatchRows<'a> {
    pub companies: Vec<&'a ShareholderRecord>,
    pub entities: Vec<(String, &'a ShareholderRecord)>,
    pub holdings: Vec<(String, &'a ShareholderRecord)>,
    /// Company total shares, last non-empty value per orgnr
    company_totals: HashMap<&'a str, i64>,
}

impl<'a> BatchRows<'a> {
    pub fn collapse(records: &'a [ShareholderRecord]) -> Self {
        let mut companies: HashMap<&str, usize> = HashMap::new();
        let mut company_totals = HashMap::new();
        let mut entities: HashMap<String, usize> = HashMap::new();
        let mut holdings: HashMap<(String, String, String), usize> = HashMap::new();

        for (i, record) in records.iter().enumerate() {
            companies.insert(record.orgnr.as_str(), i);
            if let Some(total) = record.total_shares {
                company_totals.insert(record.orgnr.as_str(), total);
            }
            let key = record.entity_key();
            entities.insert(key.clone(), i);
            holdings.insert((record.orgnr.clone(), key, record.share_class.clone()), i);
        }

        let mut company_rows: Vec<usize> = companies.into_values().collect();
        company_rows.sort_unstable();
        let mut entity_rows: Vec<(String, usize)> = entities.into_iter().collect();
        entity_rows.sort_unstable_by_key(|(_, i)| *i);
        let mut holding_rows: Vec<(String, usize)> = holdings
            .into_iter()
            .map(|((_, key, _), i)| (key, i))
            .collect();
        holding_rows.sort_unstable_by_key(|(_, i)| *i);

        Self {
            companies: company_rows.into_iter().map(|i| &records[i]).collect(),
            entities: entity_rows.into_iter().map(|(k, i)| (k, &records[i])).collect(),
            holdings: holding_rows.into_iter().map(|(k, i)| (k, &records[i])).collect(),
            company_totals,
        }
    }

    fn total_shares(&self, orgnr: &str) -> Option<i64> {
        self.company_totals.get(orgnr).copied()
    }
}

/// Upsert companies, entities and holdings of one batch
pub async fn upsert_batch(
    tx: &mut Transaction<'_, Postgres>,
    session_id: Uuid,
    scope: Uuid,
    year: i32,
    records: &[ShareholderRecord],
) -> Result<()> {
    let rows = BatchRows::collapse(records);

    // Companies
    let orgnrs: Vec<&str> = rows.companies.iter().map(|r| r.orgnr.as_str()).collect();
    let names: Vec<&str> = rows.companies.iter().map(|r| r.company_name.as_str()).collect();
    let totals: Vec<Option<i64>> = rows.companies.iter().map(|r| rows.total_shares(&r.orgnr)).collect();
    sqlx::query(
        r#"
        INSERT INTO share_companies (scope, year, orgnr, name, total_shares)
        SELECT $1, $2, c.orgnr, c.name, c.total_shares
        FROM UNNEST($3::text[], $4::text[], $5::bigint[]) AS c(orgnr, name, total_shares)
        ON CONFLICT (scope, year, orgnr) DO UPDATE
            SET name = EXCLUDED.name,
                total_shares = COALESCE(EXCLUDED.total_shares, share_companies.total_shares),
                updated_at = NOW()
        "#,
    )
    .bind(scope)
    .bind(year)
    .bind(&orgnrs)
    .bind(&names)
    .bind(&totals)
    .execute(&mut **tx)
    .await?;

    // Entities
    let mut keys = Vec::with_capacity(rows.entities.len());
    let mut types = Vec::with_capacity(rows.entities.len());
    let mut entity_names = Vec::with_capacity(rows.entities.len());
    let mut entity_orgnrs: Vec<Option<&str>> = Vec::with_capacity(rows.entities.len());
    let mut birth_years: Vec<Option<i32>> = Vec::with_capacity(rows.entities.len());
    let mut countries = Vec::with_capacity(rows.entities.len());
    let mut postal_places: Vec<Option<&str>> = Vec::with_capacity(rows.entities.len());
    for (key, record) in &rows.entities {
        keys.push(key.as_str());
        entity_names.push(record.holder_name.as_str());
        postal_places.push(record.postal_place.as_deref());
        match &record.holder {
            Holder::Company { holder_orgnr } => {
                types.push("company");
                entity_orgnrs.push(Some(holder_orgnr.as_str()));
                birth_years.push(None);
                countries.push("NO");
            }
            Holder::Person { birth_year, country_code } => {
                types.push("person");
                entity_orgnrs.push(None);
                birth_years.push(*birth_year);
                countries.push(country_code.as_str());
            }
        }
    }
    sqlx::query(
        r#"
        INSERT INTO share_entities (scope, entity_key, entity_type, name, orgnr, birth_year, country_code, postal_place)
        SELECT $1, e.entity_key, e.entity_type, e.name, e.orgnr, e.birth_year, e.country_code, e.postal_place
        FROM UNNEST($2::text[], $3::text[], $4::text[], $5::text[], $6::int[], $7::text[], $8::text[])
            AS e(entity_key, entity_type, name, orgnr, birth_year, country_code, postal_place)
        ON CONFLICT (scope, entity_key) DO UPDATE
            SET name = EXCLUDED.name,
                postal_place = COALESCE(EXCLUDED.postal_place, share_entities.postal_place),
                updated_at = NOW()
        "#,
    )
    .bind(scope)
    .bind(&keys)
    .bind(&types)
    .bind(&entity_names)
    .bind(&entity_orgnrs)
    .bind(&birth_years)
    .bind(&countries)
    .bind(&postal_places)
    .execute(&mut **tx)
    .await?;

    // Holdings
    let holding_orgnrs: Vec<&str> = rows.holdings.iter().map(|(_, r)| r.orgnr.as_str()).collect();
    let holding_keys: Vec<&str> = rows.holdings.iter().map(|(k, _)| k.as_str()).collect();
    let classes: Vec<&str> = rows.holdings.iter().map(|(_, r)| r.share_class.as_str()).collect();
    let shares: Vec<i64> = rows.holdings.iter().map(|(_, r)| r.shares).collect();
    sqlx::query(
        r#"
        INSERT INTO share_holdings (scope, year, company_orgnr, entity_key, share_class, shares, session_id)
        SELECT $1, $2, h.company_orgnr, h.entity_key, h.share_class, h.shares, $3
        FROM UNNEST($4::text[], $5::text[], $6::text[], $7::bigint[])
            AS h(company_orgnr, entity_key, share_class, shares)
        ON CONFLICT (scope, year, company_orgnr, entity_key, share_class) DO UPDATE
            SET shares = EXCLUDED.shares,
                session_id = EXCLUDED.session_id,
                updated_at = NOW()
        "#,
    )
    .bind(scope)
    .bind(year)
    .bind(session_id)
    .bind(&holding_orgnrs)
    .bind(&holding_keys)
    .bind(&classes)
    .bind(&shares)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Fill missing company totals from holdings and count the imported data
pub async fn aggregate(pool: &PgPool, scope: Uuid, year: i32) -> Result<FinishSummary> {
    sqlx::query(
        r#"
        UPDATE share_companies c
        SET total_shares = s.total, updated_at = NOW()
        FROM (
            SELECT company_orgnr, SUM(shares)::bigint AS total
            FROM share_holdings
            WHERE scope = $1 AND year = $2
            GROUP BY company_orgnr
        ) s
        WHERE c.scope = $1 AND c.year = $2 AND c.orgnr = s.company_orgnr
          AND (c.total_shares IS NULL OR c.total_shares = 0)
        "#,
    )
    .bind(scope)
    .bind(year)
    .execute(pool)
    .await?;

    let (companies, holdings, entities): (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM share_companies WHERE scope = $1 AND year = $2),
            (SELECT COUNT(*) FROM share_holdings WHERE scope = $1 AND year = $2),
            (SELECT COUNT(DISTINCT entity_key) FROM share_holdings WHERE scope = $1 AND year = $2)
        "#,
    )
    .bind(scope)
    .bind(year)
    .fetch_one(pool)
    .await?;

    Ok(FinishSummary { companies, holdings, entities, year })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(orgnr: &str, holder: &str, class: &str, shares: i64, total: Option<i64>) -> ShareholderRecord {
        ShareholderRecord {
            row_number: 1,
            orgnr: orgnr.to_string(),
            company_name: format!("Selskap {}", orgnr),
            share_class: class.to_string(),
            holder_name: holder.to_string(),
            holder: Holder::Person { birth_year: None, country_code: "NO".to_string() },
            postal_place: None,
            shares,
            total_shares: total,
        }
    }

    #[test]
    fn test_collapse_keeps_last_holding() {
        let records = vec![
            record("912345678", "Ola", "Ordinære", 10, None),
            record("912345678", "Ola", "Ordinære", 15, None),
            record("912345678", "Ola", "B-aksjer", 5, None),
        ];
        let rows = BatchRows::collapse(&records);
        assert_eq!(rows.companies.len(), 1);
        assert_eq!(rows.entities.len(), 1);
        assert_eq!(rows.holdings.len(), 2);
        assert_eq!(rows.holdings[0].1.shares, 15);
        assert_eq!(rows.holdings[1].1.shares, 5);
    }

    #[test]
    fn test_collapse_keeps_known_total_shares() {
        let records = vec![
            record("912345678", "Ola", "Ordinære", 10, Some(100)),
            record("912345678", "Kari", "Ordinære", 90, None),
        ];
        let rows = BatchRows::collapse(&records);
        assert_eq!(rows.total_shares("912345678"), Some(100));
        assert_eq!(rows.entities.len(), 2);
    }

    #[test]
    fn test_person_names_fold_case_into_one_entity() {
        let records = vec![
            record("912345678", "Ola Nordmann", "Ordinære", 10, None),
            record("987654321", "OLA NORDMANN", "Ordinære", 20, None),
        ];
        let rows = BatchRows::collapse(&records);
        assert_eq!(rows.entities.len(), 1);
        assert_eq!(rows.entities[0].1.orgnr, "987654321");
        assert_eq!(rows.holdings.len(), 2);
    }
}
