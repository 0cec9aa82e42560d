use crate::db;
use crate::fees::PaymentMethod;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::get_required_str;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum Rule {
    Flag { default: bool },
    Int { min: i64, max: i64, default: i64 },
    Text { max_len: usize, required: bool, default: &'static str },
    Method { default: PaymentMethod },
}

struct FieldSpec {
    key: &'static str,
    rule: Rule,
}

const ROOMS_FIELDS: &[FieldSpec] = &[
    FieldSpec { key: "defaultCapacity", rule: Rule::Int { min: 1, max: 20, default: 3 } },
    FieldSpec { key: "enforceCapacity", rule: Rule::Flag { default: false } },
];

const FEES_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        key: "currencySymbol",
        rule: Rule::Text { max_len: 4, required: true, default: "₹" },
    },
    FieldSpec {
        key: "defaultPaymentMethod",
        rule: Rule::Method { default: PaymentMethod::Cash },
    },
];

const INVOICE_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        key: "institutionName",
        rule: Rule::Text { max_len: 120, required: true, default: "Hostel Management System" },
    },
    FieldSpec {
        key: "footer",
        rule: Rule::Text { max_len: 400, required: false, default: "" },
    },
];

impl Rule {
    fn default_value(self) -> Value {
        match self {
            Rule::Flag { default } => Value::Bool(default),
            Rule::Int { default, .. } => Value::from(default),
            Rule::Text { default, .. } => Value::String(default.to_string()),
            Rule::Method { default } => Value::String(default.as_str().to_string()),
        }
    }

    fn check(self, key: &str, v: &Value) -> Result<Value, String> {
        match self {
            Rule::Flag { .. } => v
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| format!("{} must be boolean", key)),
            Rule::Int { min, max, .. } => {
                let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
                if !(min..=max).contains(&n) {
                    return Err(format!("{} must be in {}..={}", key, min, max));
                }
                Ok(Value::from(n))
            }
            Rule::Text { max_len, required, .. } => {
                let s = v
                    .as_str()
                    .ok_or_else(|| format!("{} must be string", key))?
                    .trim();
                if required && s.is_empty() {
                    return Err(format!("{} must not be empty", key));
                }
                if s.chars().count() > max_len {
                    return Err(format!("{} length must be <= {}", key, max_len));
                }
                Ok(Value::String(s.to_string()))
            }
            Rule::Method { .. } => v
                .as_str()
                .and_then(PaymentMethod::parse)
                .map(|m| Value::String(m.as_str().to_string()))
                .ok_or_else(|| format!("{} must be one of: cash, upi, bank_transfer", key)),
        }
    }
}

#[derive(Clone, Copy)]
enum SetupSection {
    Rooms,
    Fees,
    Invoice,
}

const ALL_SECTIONS: [SetupSection; 3] = [SetupSection::Rooms, SetupSection::Fees, SetupSection::Invoice];

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        ALL_SECTIONS.into_iter().find(|sec| sec.name() == s)
    }

    fn name(self) -> &'static str {
        match self {
            Self::Rooms => "rooms",
            Self::Fees => "fees",
            Self::Invoice => "invoice",
        }
    }

    fn key(self) -> String {
        format!("setup.{}", self.name())
    }

    fn fields(self) -> &'static [FieldSpec] {
        match self {
            Self::Rooms => ROOMS_FIELDS,
            Self::Fees => FEES_FIELDS,
            Self::Invoice => INVOICE_FIELDS,
        }
    }

    fn defaults(self) -> Map<String, Value> {
        self.fields()
            .iter()
            .map(|f| (f.key.to_string(), f.rule.default_value()))
            .collect()
    }

    /// Validates every key of `patch` and writes it into `into`. The first
    /// bad key aborts, leaving `into` partly updated.
    fn apply(self, into: &mut Map<String, Value>, patch: &Map<String, Value>) -> Result<(), String> {
        for (k, v) in patch {
            let field = self
                .fields()
                .iter()
                .find(|f| f.key == k.as_str())
                .ok_or_else(|| format!("unknown {} field: {}", self.name(), k))?;
            into.insert(k.clone(), field.rule.check(k, v)?);
        }
        Ok(())
    }
}

/// Stored section merged over defaults. Stored keys that no longer validate
/// are dropped one at a time instead of discarding the whole section.
fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Map<String, Value>> {
    let mut current = section.defaults();
    if let Some(Value::Object(saved)) = db::settings_get_json(conn, &section.key())? {
        for (k, v) in &saved {
            let mut single = Map::new();
            single.insert(k.clone(), v.clone());
            if let Err(msg) = section.apply(&mut current, &single) {
                tracing::warn!(section = section.name(), "ignoring stored setting: {}", msg);
            }
        }
    }
    Ok(current)
}

fn section_field(conn: &Connection, section: SetupSection, field: &str) -> Value {
    let loaded = load_section(conn, section).unwrap_or_else(|e| {
        tracing::warn!("failed to load {}: {e:#}", section.key());
        section.defaults()
    });
    loaded.get(field).cloned().unwrap_or(Value::Null)
}

pub fn rooms_enforce_capacity(conn: &Connection) -> bool {
    section_field(conn, SetupSection::Rooms, "enforceCapacity")
        .as_bool()
        .unwrap_or(false)
}

pub fn rooms_default_capacity(conn: &Connection) -> i64 {
    section_field(conn, SetupSection::Rooms, "defaultCapacity")
        .as_i64()
        .unwrap_or(3)
}

pub fn currency_symbol(conn: &Connection) -> String {
    section_field(conn, SetupSection::Fees, "currencySymbol")
        .as_str()
        .unwrap_or("₹")
        .to_string()
}

pub fn default_payment_method(conn: &Connection) -> PaymentMethod {
    section_field(conn, SetupSection::Fees, "defaultPaymentMethod")
        .as_str()
        .and_then(PaymentMethod::parse)
        .unwrap_or(PaymentMethod::Cash)
}

/// (institution name, footer) printed on invoices.
pub fn invoice_branding(conn: &Connection) -> (String, String) {
    let name = section_field(conn, SetupSection::Invoice, "institutionName")
        .as_str()
        .unwrap_or("Hostel Management System")
        .to_string();
    let footer = section_field(conn, SetupSection::Invoice, "footer")
        .as_str()
        .unwrap_or("")
        .to_string();
    (name, footer)
}

fn conn_of(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn parse_section(raw: &str) -> Result<SetupSection, HandlerErr> {
    SetupSection::parse(raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown section: {}", raw)))
}

fn load_or_fail(conn: &Connection, section: SetupSection) -> Result<Map<String, Value>, HandlerErr> {
    load_section(conn, section).map_err(|e| HandlerErr::new("db_query_failed", format!("{e:#}")))
}

fn setup_get(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = conn_of(state)?;
    if let Some(raw) = params.get("section").and_then(|v| v.as_str()) {
        let section = parse_section(raw)?;
        return Ok(Value::Object(load_or_fail(conn, section)?));
    }
    let mut all = Map::new();
    for section in ALL_SECTIONS {
        all.insert(section.name().to_string(), Value::Object(load_or_fail(conn, section)?));
    }
    Ok(Value::Object(all))
}

fn setup_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = conn_of(state)?;
    let section = parse_section(&get_required_str(params, "section")?)?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;

    let mut current = load_or_fail(conn, section)?;
    section.apply(&mut current, patch).map_err(HandlerErr::bad_params)?;
    let current = Value::Object(current);
    db::settings_set_json(conn, &section.key(), &current)
        .map_err(|e| HandlerErr::new("db_update_failed", format!("{e:#}")))?;
    tracing::info!(section = section.name(), "setup updated");
    Ok(json!({ "ok": true, "section": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "setup.get" => setup_get(state, &req.params),
        "setup.update" => setup_update(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
