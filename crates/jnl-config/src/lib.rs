//! jnl-config
//!
//! Engine configuration: sign-flip policy, timestamp tolerance, instrument
//! multipliers, audit log location. Loaded from YAML, validated on load,
//! and hashed (SHA-256 over canonical JSON) so every run can be stamped
//! with the exact configuration it ran under.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use jnl_positions::{FlowConfig, SignFlipPolicy};
use jnl_schemas::MICROS_SCALE;

// ---------------------------------------------------------------------------
// File shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// "strict" or "permissive".
    pub sign_flip_policy: String,
    #[serde(default)]
    pub timestamp_tolerance_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentEntry {
    /// Contract multiplier as a decimal string, e.g. "50" or "0.1".
    pub multiplier: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSection {
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub hash_chain: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub engine: EngineSection,
    #[serde(default)]
    pub instruments: BTreeMap<String, InstrumentEntry>,
    #[serde(default)]
    pub audit: AuditSection,
}

// ---------------------------------------------------------------------------
// Validated config
// ---------------------------------------------------------------------------

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    raw: ConfigFile,
    flow: FlowConfig,
    multipliers_micros: BTreeMap<String, i64>,
}

impl EngineConfig {
    /// Load and validate a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let raw: ConfigFile = serde_yaml::from_str(text).context("parse config YAML")?;

        let sign_flip = match raw.engine.sign_flip_policy.as_str() {
            "strict" => SignFlipPolicy::Strict,
            "permissive" => SignFlipPolicy::Permissive,
            other => bail!("unknown sign_flip_policy {other:?}; expected strict or permissive"),
        };
        if raw.engine.timestamp_tolerance_ms < 0 {
            bail!(
                "timestamp_tolerance_ms must be >= 0, got {}",
                raw.engine.timestamp_tolerance_ms
            );
        }

        let mut multipliers_micros = BTreeMap::new();
        for (instrument, entry) in &raw.instruments {
            let micros = parse_decimal_micros(&entry.multiplier).with_context(|| {
                format!("instrument {instrument}: multiplier {:?}", entry.multiplier)
            })?;
            if micros <= 0 {
                bail!(
                    "instrument {instrument}: multiplier must be > 0, got {:?}",
                    entry.multiplier
                );
            }
            multipliers_micros.insert(instrument.clone(), micros);
        }

        let flow = FlowConfig {
            sign_flip,
            timestamp_tolerance_ms: raw.engine.timestamp_tolerance_ms,
        };
        Ok(Self {
            raw,
            flow,
            multipliers_micros,
        })
    }

    /// The flow policy config handed to builder/validator/repair.
    pub fn flow_config(&self) -> FlowConfig {
        self.flow
    }

    /// Contract multiplier for an instrument (micros scale). Instruments
    /// not listed default to 1.0 (equities and anything quoted per unit).
    pub fn instrument_multiplier(&self, instrument: &str) -> i64 {
        self.multipliers_micros
            .get(instrument)
            .copied()
            .unwrap_or(MICROS_SCALE)
    }

    pub fn audit(&self) -> &AuditSection {
        &self.raw.audit
    }

    /// SHA-256 over the canonical JSON rendering of the effective config.
    /// Stable across key order and YAML formatting differences.
    pub fn config_hash(&self) -> Result<String> {
        let value = serde_json::to_value(&self.raw).context("serialize config for hashing")?;
        let canonical = canonicalize(&value);
        let text = serde_json::to_string(&canonical).context("render canonical config")?;
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Sort object keys recursively so hashing is order-independent.
fn canonicalize(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: BTreeMap<String, Value> = BTreeMap::new();
            for (k, val) in map {
                sorted.insert(k.clone(), canonicalize(val));
            }
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Parse a decimal string ("50", "0.1", "1000.25") into micros.
/// At most 6 fractional digits; no exponents, no signs.
pub fn parse_decimal_micros(s: &str) -> Result<i64> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty decimal");
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if frac.len() > 6 {
        bail!("more than 6 fractional digits: {s:?}");
    }
    if !whole.chars().all(|c| c.is_ascii_digit())
        || !frac.chars().all(|c| c.is_ascii_digit())
        || (whole.is_empty() && frac.is_empty())
    {
        bail!("not a plain decimal: {s:?}");
    }
    let whole_val: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().with_context(|| format!("whole part of {s:?}"))?
    };
    let mut frac_micros: i64 = 0;
    if !frac.is_empty() {
        let padded = format!("{frac:0<6}");
        frac_micros = padded.parse().with_context(|| format!("fraction of {s:?}"))?;
    }
    whole_val
        .checked_mul(MICROS_SCALE)
        .and_then(|w| w.checked_add(frac_micros))
        .ok_or_else(|| anyhow::anyhow!("decimal out of range: {s:?}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
engine:
  sign_flip_policy: strict
  timestamp_tolerance_ms: 250
instruments:
  ES: { multiplier: "50" }
  CL: { multiplier: "1000" }
  MES: { multiplier: "5" }
audit:
  log_path: ./audit/repairs.jsonl
  hash_chain: true
"#;

    #[test]
    fn loads_and_exposes_flow_config() {
        let cfg = EngineConfig::from_yaml_str(SAMPLE).unwrap();
        let flow = cfg.flow_config();
        assert_eq!(flow.sign_flip, SignFlipPolicy::Strict);
        assert_eq!(flow.timestamp_tolerance_ms, 250);
        assert!(cfg.audit().hash_chain);
    }

    #[test]
    fn multipliers_parse_to_micros() {
        let cfg = EngineConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(cfg.instrument_multiplier("ES"), 50 * MICROS_SCALE);
        assert_eq!(cfg.instrument_multiplier("CL"), 1000 * MICROS_SCALE);
    }

    #[test]
    fn unlisted_instrument_defaults_to_one() {
        let cfg = EngineConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(cfg.instrument_multiplier("AAPL"), MICROS_SCALE);
    }

    #[test]
    fn permissive_policy_parses() {
        let cfg = EngineConfig::from_yaml_str(
            "engine:\n  sign_flip_policy: permissive\n",
        )
        .unwrap();
        assert_eq!(cfg.flow_config().sign_flip, SignFlipPolicy::Permissive);
        assert_eq!(cfg.flow_config().timestamp_tolerance_ms, 0);
    }

    #[test]
    fn unknown_policy_rejected() {
        let err = EngineConfig::from_yaml_str("engine:\n  sign_flip_policy: lenient\n")
            .unwrap_err();
        assert!(err.to_string().contains("unknown sign_flip_policy"));
    }

    #[test]
    fn negative_tolerance_rejected() {
        let err = EngineConfig::from_yaml_str(
            "engine:\n  sign_flip_policy: strict\n  timestamp_tolerance_ms: -1\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("timestamp_tolerance_ms"));
    }

    #[test]
    fn zero_multiplier_rejected() {
        let yaml = "engine:\n  sign_flip_policy: strict\ninstruments:\n  X: { multiplier: \"0\" }\n";
        assert!(EngineConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn decimal_parsing() {
        assert_eq!(parse_decimal_micros("50").unwrap(), 50_000_000);
        assert_eq!(parse_decimal_micros("0.1").unwrap(), 100_000);
        assert_eq!(parse_decimal_micros("1000.25").unwrap(), 1_000_250_000);
        assert_eq!(parse_decimal_micros(".5").unwrap(), 500_000);
        assert!(parse_decimal_micros("1.2345678").is_err());
        assert!(parse_decimal_micros("-1").is_err());
        assert!(parse_decimal_micros("1e3").is_err());
        assert!(parse_decimal_micros("").is_err());
    }

    #[test]
    fn config_hash_is_stable_and_discriminating() {
        let a = EngineConfig::from_yaml_str(SAMPLE).unwrap();
        let b = EngineConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(a.config_hash().unwrap(), b.config_hash().unwrap());

        let changed = EngineConfig::from_yaml_str(
            "engine:\n  sign_flip_policy: permissive\n",
        )
        .unwrap();
        assert_ne!(a.config_hash().unwrap(), changed.config_hash().unwrap());
    }
}
