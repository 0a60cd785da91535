use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Origin category of a candidate result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodType {
    Manual,
    Standard,
    Genetic,
}

impl MethodType {
    pub fn as_str(&self) -> &str {
        match self {
            MethodType::Manual => "manual",
            MethodType::Standard => "standard",
            MethodType::Genetic => "genetic",
        }
    }

    /// Category for a requested optimization method string.
    /// Unknown methods fall back to the standard (classic) search.
    pub fn from_optimization_method(method: &str) -> Self {
        match method {
            "genetic" => MethodType::Genetic,
            _ => MethodType::Standard,
        }
    }

    /// Fixed ordering used when auto-selecting one candidate per category.
    pub const ALL: [MethodType; 3] = [MethodType::Manual, MethodType::Standard, MethodType::Genetic];
}

impl std::fmt::Display for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate structure payload produced by a calculation or optimization run.
///
/// The named fields are the only ones the comparison layer reads; everything
/// else the engine returns is carried opaquely in `extra` so a re-save never
/// loses data the engine may add later.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureResult {
    pub class_a_principal: f64,
    pub class_a_interest: f64,
    pub class_b_principal: f64,
    pub class_b_coupon: f64,
    pub min_buffer_actual: f64,
    pub financing_cost: f64,
    pub total_principal_paid: f64,
    pub total_loan_principal: f64,
    #[serde(default)]
    pub tranche_results: Vec<Value>,
    #[serde(default)]
    pub interest_rate_conversions: Vec<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl StructureResult {
    /// Class A total recomputed from its parts. The payload's own aggregate
    /// field is never trusted; a partial payload must not produce a silently
    /// wrong total.
    pub fn class_a_total(&self) -> f64 {
        self.class_a_principal + self.class_a_interest
    }

    pub fn class_b_total(&self) -> f64 {
        self.class_b_principal + self.class_b_coupon
    }

    pub fn grand_total(&self) -> f64 {
        self.class_a_total() + self.class_b_total()
    }
}

/// Full optimization outcome: the comparable structure plus the winning
/// configuration the engine searched out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    pub best_strategy: String,
    pub class_a_maturities: Vec<i64>,
    pub class_a_nominals: Vec<f64>,
    pub class_a_rates: Vec<f64>,
    pub class_a_reinvest: Vec<f64>,
    pub class_b_maturity: i64,
    pub class_b_rate: f64,
    pub class_b_reinvest: f64,
    pub class_b_nominal: f64,
    pub class_b_coupon_rate: f64,
    pub last_cash_flow_day: i64,
    pub additional_days: i64,
    #[serde(default)]
    pub results_by_strategy: serde_json::Map<String, Value>,
    #[serde(flatten)]
    pub structure: StructureResult,
}

/// Deal-level settings shared by every calculation and optimization request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    pub start_date: NaiveDate,
    pub operational_expenses: f64,
    pub min_buffer: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrancheA {
    pub maturity_days: i64,
    pub base_rate: f64,
    pub spread: f64,
    pub reinvest_rate: f64,
    pub nominal: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrancheB {
    pub maturity_days: i64,
    pub base_rate: f64,
    pub spread: f64,
    pub reinvest_rate: f64,
    pub nominal: Option<f64>,
}

/// Discounting method for NPV figures in the result payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NpvSettings {
    pub method: String,
    pub custom_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationRequest {
    pub general_settings: GeneralSettings,
    pub tranches_a: Vec<TrancheA>,
    pub tranche_b: TrancheB,
    pub npv_settings: NpvSettings,
    #[serde(default)]
    pub is_optimized: bool,
    #[serde(default)]
    pub optimization_method: Option<String>,
}

/// Search-space settings for an optimization job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationSettings {
    pub optimization_method: String,
    pub selected_strategies: Vec<String>,
    pub a_tranches_range: [i64; 2],
    pub maturity_range: [i64; 2],
    pub maturity_step: i64,
    pub min_class_b_percent: f64,
    pub target_class_b_coupon_rate: f64,
    pub additional_days_for_class_b: i64,
    pub population_size: Option<u32>,
    pub num_generations: Option<u32>,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            optimization_method: "standard".to_string(),
            selected_strategies: vec![
                "equal".to_string(),
                "increasing".to_string(),
                "decreasing".to_string(),
                "middle_weighted".to_string(),
            ],
            a_tranches_range: [2, 6],
            maturity_range: [32, 365],
            maturity_step: 10,
            min_class_b_percent: 10.0,
            target_class_b_coupon_rate: 30.0,
            additional_days_for_class_b: 10,
            population_size: Some(50),
            num_generations: Some(40),
        }
    }
}

/// A named, timestamped snapshot of a completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedResult {
    pub id: String,
    pub name: String,
    pub method_type: MethodType,
    pub created_at: DateTime<Utc>,
    pub structure: StructureResult,
}

impl SavedResult {
    pub fn new(name: String, method_type: MethodType, structure: StructureResult) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            method_type,
            created_at: Utc::now(),
            structure,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub engine_base_url: String,
    pub database_path: String,
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let engine_base_url = std::env::var("ENGINE_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8000".to_string());

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./structurer.db".to_string());

        let request_timeout_secs = std::env::var("ENGINE_REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        Ok(Self {
            engine_base_url,
            database_path,
            request_timeout_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_type_wire_names() {
        assert_eq!(MethodType::Manual.as_str(), "manual");
        assert_eq!(MethodType::Standard.as_str(), "standard");
        assert_eq!(MethodType::Genetic.as_str(), "genetic");

        let json = serde_json::to_string(&MethodType::Genetic).unwrap();
        assert_eq!(json, "\"genetic\"");
        let back: MethodType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, MethodType::Genetic);
    }

    #[test]
    fn test_unknown_method_defaults_to_standard() {
        assert_eq!(
            MethodType::from_optimization_method("simulated_annealing"),
            MethodType::Standard
        );
        assert_eq!(
            MethodType::from_optimization_method("genetic"),
            MethodType::Genetic
        );
    }

    #[test]
    fn test_totals_recomputed_from_parts() {
        let result = StructureResult {
            class_a_principal: 700_000.0,
            class_a_interest: 50_000.0,
            class_b_principal: 200_000.0,
            class_b_coupon: 30_000.0,
            ..Default::default()
        };
        assert_eq!(result.class_a_total(), 750_000.0);
        assert_eq!(result.class_b_total(), 230_000.0);
        assert_eq!(result.grand_total(), 980_000.0);
    }

    #[test]
    fn test_structure_result_keeps_unknown_fields() {
        let json = r#"{
            "class_a_principal": 1.0,
            "class_a_interest": 2.0,
            "class_b_principal": 3.0,
            "class_b_coupon": 4.0,
            "min_buffer_actual": 5.0,
            "financing_cost": 6.0,
            "total_principal_paid": 7.0,
            "total_loan_principal": 8.0,
            "npv_value": 123.45
        }"#;
        let result: StructureResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.extra.get("npv_value").and_then(Value::as_f64), Some(123.45));

        let round_tripped = serde_json::to_value(&result).unwrap();
        assert_eq!(round_tripped.get("npv_value").and_then(Value::as_f64), Some(123.45));
    }
}
