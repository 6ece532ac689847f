//! Feature pricing lookups.

use crate::error::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::fmt;

/// Pricing category of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCategory {
    /// Always free; never reserved
    Basic,
    /// Paid per use
    Premium,
}

impl fmt::Display for FeatureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

/// Price of one feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturePricing {
    /// Feature code (the analysis option name)
    pub code: String,
    /// Credits charged per use
    pub credits_cost: i64,
    /// Pricing category
    pub category: FeatureCategory,
    /// Inactive features cannot be reserved
    pub active: bool,
}

impl FeaturePricing {
    /// Whether using this feature never costs anything.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.category == FeatureCategory::Basic || self.credits_cost == 0
    }
}

/// Look up the price of a feature.
pub async fn get_feature_pricing(
    conn: &mut SqliteConnection,
    code: &str,
) -> Result<Option<FeaturePricing>> {
    let row = sqlx::query(
        "SELECT code, credits_cost, category, active FROM feature_pricing WHERE code = ?",
    )
    .bind(code)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(pricing_from_row).transpose()
}

/// All configured prices, ordered by code.
pub async fn list_feature_pricing(pool: &SqlitePool) -> Result<Vec<FeaturePricing>> {
    let rows = sqlx::query(
        "SELECT code, credits_cost, category, active FROM feature_pricing ORDER BY code",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(pricing_from_row).collect()
}

/// Insert or replace the price of a feature.
pub async fn upsert_feature_pricing(pool: &SqlitePool, pricing: &FeaturePricing) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO feature_pricing (code, credits_cost, category, active)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(code) DO UPDATE SET
            credits_cost = excluded.credits_cost,
            category = excluded.category,
            active = excluded.active
        ",
    )
    .bind(&pricing.code)
    .bind(pricing.credits_cost)
    .bind(pricing.category.to_string())
    .bind(pricing.active)
    .execute(pool)
    .await?;

    Ok(())
}

fn pricing_from_row(row: &SqliteRow) -> Result<FeaturePricing> {
    let category: String = row.try_get("category")?;
    let category = match category.as_str() {
        "basic" => FeatureCategory::Basic,
        "premium" => FeatureCategory::Premium,
        other => {
            return Err(DatabaseError::Decode(format!(
                "invalid pricing category '{other}'"
            )))
        }
    };

    Ok(FeaturePricing {
        code: row.try_get("code")?,
        credits_cost: row.try_get("credits_cost")?,
        category,
        active: row.try_get("active")?,
    })
}
