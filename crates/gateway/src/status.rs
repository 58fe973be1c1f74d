//! Response shapes for the status endpoints. Emails never appear here,
//! only masked display names.

use serde::Serialize;

use crate::account::Account;

/// Aggregate health payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always "ok" when the listener is up.
    pub status: &'static str,
    /// Number of configured accounts.
    pub account_count: usize,
    /// Per-account summary.
    pub accounts: Vec<HealthAccount>,
}

/// One account in the health payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthAccount {
    /// Masked identity.
    pub display_name: String,
    /// Whether the account participates in selection.
    pub enabled: bool,
    /// Whether the account is flagged invalid.
    pub invalid: bool,
    /// Number of models currently rate-limited on this account.
    pub rate_limited_models: usize,
}

/// Per-(account, model) quota snapshot.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsResponse {
    /// Per-account entries.
    pub accounts: Vec<LimitsAccount>,
}

/// Quota rows for one account.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsAccount {
    /// Masked identity.
    pub display_name: String,
    /// Per-model rows.
    pub models: Vec<LimitsModel>,
}

/// One (account, model) row.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsModel {
    /// Model identifier.
    pub model: String,
    /// Whether the pair is cooling down.
    pub is_rate_limited: bool,
    /// When the cooldown lifts, epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_epoch_ms: Option<i64>,
    /// Last-known remaining quota fraction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_fraction: Option<f64>,
}

/// Build the health payload from a pool snapshot.
pub fn health(accounts: &[Account]) -> HealthResponse {
    HealthResponse {
        status: "ok",
        account_count: accounts.len(),
        accounts: accounts
            .iter()
            .map(|account| HealthAccount {
                display_name: account.display_name(),
                enabled: account.enabled,
                invalid: account.is_invalid(),
                rate_limited_models: account
                    .model_rate_limits
                    .values()
                    .filter(|state| state.is_rate_limited)
                    .count(),
            })
            .collect(),
    }
}

/// Build the quota snapshot from a pool snapshot, merging live rate-limit
/// state with the last-known quota.
pub fn limits(accounts: &[Account]) -> LimitsResponse {
    LimitsResponse {
        accounts: accounts
            .iter()
            .map(|account| {
                let mut models: std::collections::BTreeMap<String, LimitsModel> = account
                    .quota
                    .models
                    .iter()
                    .map(|(model, quota)| {
                        (
                            model.clone(),
                            LimitsModel {
                                model: model.clone(),
                                is_rate_limited: false,
                                reset_epoch_ms: quota.reset_epoch_ms,
                                remaining_fraction: quota.remaining_fraction,
                            },
                        )
                    })
                    .collect();

                for (model, state) in &account.model_rate_limits {
                    let entry = models.entry(model.clone()).or_insert_with(|| LimitsModel {
                        model: model.clone(),
                        is_rate_limited: false,
                        reset_epoch_ms: None,
                        remaining_fraction: None,
                    });

                    entry.is_rate_limited = state.is_rate_limited;
                    entry.reset_epoch_ms = Some(state.reset_epoch_ms);
                }

                LimitsAccount {
                    display_name: account.display_name(),
                    models: models.into_values().collect(),
                }
            })
            .collect(),
    }
}

/// Render the quota snapshot as an ASCII table for `?format=table`.
pub fn render_table(limits: &LimitsResponse) -> String {
    let header = ["Account", "Model", "Limited", "Reset (epoch ms)", "Remaining"];

    let mut rows: Vec<[String; 5]> = Vec::new();

    for account in &limits.accounts {
        if account.models.is_empty() {
            rows.push([
                account.display_name.clone(),
                "-".to_string(),
                "no".to_string(),
                "-".to_string(),
                "-".to_string(),
            ]);
            continue;
        }

        for model in &account.models {
            rows.push([
                account.display_name.clone(),
                model.model.clone(),
                if model.is_rate_limited { "yes" } else { "no" }.to_string(),
                model.reset_epoch_ms.map(|ms| ms.to_string()).unwrap_or_else(|| "-".to_string()),
                model
                    .remaining_fraction
                    .map(|fraction| format!("{:.0}%", fraction * 100.0))
                    .unwrap_or_else(|| "-".to_string()),
            ]);
        }
    }

    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let separator: String = {
        let mut line = String::from("+");
        for width in &widths {
            line.push_str(&"-".repeat(width + 2));
            line.push('+');
        }
        line
    };

    let format_row = |cells: &[String]| {
        let mut line = String::from("|");
        for (i, cell) in cells.iter().enumerate() {
            line.push_str(&format!(" {:<width$} |", cell, width = widths[i]));
        }
        line
    };

    let mut output = String::new();
    output.push_str(&separator);
    output.push('\n');
    output.push_str(&format_row(&header.map(String::from)));
    output.push('\n');
    output.push_str(&separator);
    output.push('\n');

    for row in &rows {
        output.push_str(&format_row(row.as_slice()));
        output.push('\n');
    }

    output.push_str(&separator);
    output.push('\n');

    output
}
