use crate::fees::{self, FeeStatus, PaymentMethod};
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::handlers::{setup, students};
use crate::ipc::helpers::{
    get_as_of, get_date, get_money, get_opt_str, get_patch, get_required_str, in_tx, with_db,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

pub(crate) struct FeeRow {
    pub id: String,
    pub student_id: String,
    pub academic_year: String,
    pub fee_year: String,
    pub amount_minor: i64,
    pub paid_minor: i64,
    pub status: String,
    pub due_date: String,
    pub payment_date: Option<String>,
    pub payment_method: Option<String>,
    pub transaction_id: Option<String>,
    pub remarks: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl FeeRow {
    /// Status against `as_of`. Rows with an unreadable due date keep what was stored.
    pub fn effective_status(&self, as_of: NaiveDate) -> FeeStatus {
        match fees::parse_date(&self.due_date) {
            Some(due) => fees::derive_status(self.amount_minor, self.paid_minor, due, as_of),
            None => FeeStatus::parse(&self.status).unwrap_or(FeeStatus::Pending),
        }
    }

    pub fn to_json(&self, as_of: NaiveDate) -> Value {
        json!({
            "id": self.id,
            "studentId": self.student_id,
            "academicYear": self.academic_year,
            "feeYear": self.fee_year,
            "amount": fees::from_minor(self.amount_minor),
            "paidAmount": fees::from_minor(self.paid_minor),
            "balance": fees::from_minor((self.amount_minor - self.paid_minor).max(0)),
            "status": self.status,
            "effectiveStatus": self.effective_status(as_of).as_str(),
            "dueDate": self.due_date,
            "paymentDate": self.payment_date,
            "paymentMethod": self.payment_method,
            "transactionId": self.transaction_id,
            "remarks": self.remarks,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

const FEE_SELECT: &str = "SELECT id, student_id, academic_year, fee_year, amount_minor, paid_minor,
        status, due_date, payment_date, payment_method, transaction_id, remarks,
        created_at, updated_at
     FROM fees";

fn map_fee(r: &rusqlite::Row<'_>) -> rusqlite::Result<FeeRow> {
    Ok(FeeRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        academic_year: r.get(2)?,
        fee_year: r.get(3)?,
        amount_minor: r.get(4)?,
        paid_minor: r.get(5)?,
        status: r.get(6)?,
        due_date: r.get(7)?,
        payment_date: r.get(8)?,
        payment_method: r.get(9)?,
        transaction_id: r.get(10)?,
        remarks: r.get(11)?,
        created_at: r.get(12)?,
        updated_at: r.get(13)?,
    })
}

pub(crate) fn load_fees(
    conn: &Connection,
    student_row_id: Option<&str>,
) -> Result<Vec<FeeRow>, HandlerErr> {
    let rows = match student_row_id {
        Some(sid) => {
            let sql = format!("{} WHERE student_id = ? ORDER BY due_date, created_at", FEE_SELECT);
            let mut stmt = conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
            let rows = stmt
                .query_map([sid], map_fee)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(db_err("db_query_failed"))?;
            rows
        }
        None => {
            let sql = format!("{} ORDER BY due_date, created_at", FEE_SELECT);
            let mut stmt = conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
            let rows = stmt
                .query_map([], map_fee)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(db_err("db_query_failed"))?;
            rows
        }
    };
    Ok(rows)
}

fn load_fee(conn: &Connection, fee_id: &str) -> Result<FeeRow, HandlerErr> {
    let sql = format!("{} WHERE id = ?", FEE_SELECT);
    conn.query_row(&sql, [fee_id], map_fee)
        .optional()
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("fee"))
}

fn parse_method(raw: Option<String>, conn: &Connection) -> Result<PaymentMethod, HandlerErr> {
    match raw {
        Some(s) => PaymentMethod::parse(&s).ok_or_else(|| {
            HandlerErr::bad_params("paymentMethod must be one of: cash, upi, bank_transfer")
        }),
        None => Ok(setup::default_payment_method(conn)),
    }
}

fn require_transaction_id(
    method: PaymentMethod,
    transaction_id: &Option<String>,
) -> Result<(), HandlerErr> {
    if method.needs_transaction_id() && transaction_id.is_none() {
        return Err(HandlerErr::bad_params(format!(
            "transactionId is required for {} payments",
            method.as_str()
        )));
    }
    Ok(())
}

fn overpayment(outstanding_minor: i64) -> HandlerErr {
    HandlerErr::new("overpayment", "payment exceeds the outstanding balance").with_details(
        json!({ "outstanding": fees::from_minor(outstanding_minor.max(0)) }),
    )
}

fn fees_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_key = get_required_str(params, "studentId")?;
    let student_row_id = students::resolve_student_id(conn, &student_key)?;
    let academic_year = get_required_str(params, "academicYear")?;
    let fee_year = get_required_str(params, "feeYear")?;
    let amount = get_money(params, "amount")?
        .ok_or_else(|| HandlerErr::bad_params("missing amount"))?;
    if amount <= 0 {
        return Err(HandlerErr::bad_params("amount must be greater than 0"));
    }
    let paid = get_money(params, "paidAmount")?.unwrap_or(0);
    if paid > amount {
        return Err(overpayment(amount));
    }
    let due = get_date(params, "dueDate")?.ok_or_else(|| HandlerErr::bad_params("missing dueDate"))?;
    let as_of = get_as_of(params)?;
    let transaction_id = get_opt_str(params, "transactionId");
    let remarks = get_opt_str(params, "remarks");

    let (method, payment_date) = if paid > 0 {
        let m = parse_method(get_opt_str(params, "paymentMethod"), conn)?;
        require_transaction_id(m, &transaction_id)?;
        (Some(m), Some(fees::format_date(as_of)))
    } else {
        (None, None)
    };
    let status = fees::derive_status(amount, paid, due, as_of);

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO fees(id, student_id, academic_year, fee_year, amount_minor, paid_minor, status,
                          due_date, payment_date, payment_method, transaction_id, remarks,
                          created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                strftime('%Y-%m-%dT%H:%M:%SZ','now'), strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        rusqlite::params![
            id,
            student_row_id,
            academic_year,
            fee_year,
            amount,
            paid,
            status.as_str(),
            fees::format_date(due),
            payment_date,
            method.map(|m| m.as_str()),
            transaction_id,
            remarks,
        ],
    )
    .map_err(db_err("db_insert_failed"))?;

    Ok(json!({ "feeId": id, "status": status.as_str() }))
}

fn fees_record_payment(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let fee_id = get_required_str(params, "feeId")?;
    let amount = get_money(params, "amount")?
        .ok_or_else(|| HandlerErr::bad_params("missing amount"))?;
    if amount <= 0 {
        return Err(HandlerErr::bad_params("amount must be greater than 0"));
    }
    let method = parse_method(get_opt_str(params, "paymentMethod"), conn)?;
    let transaction_id = get_opt_str(params, "transactionId");
    require_transaction_id(method, &transaction_id)?;
    let as_of = get_as_of(params)?;

    let fee = load_fee(conn, &fee_id)?;
    let outstanding = fee.amount_minor - fee.paid_minor;
    if amount > outstanding {
        return Err(overpayment(outstanding));
    }
    let paid = fee.paid_minor + amount;
    let due = fees::parse_date(&fee.due_date).unwrap_or(as_of);
    let status = fees::derive_status(fee.amount_minor, paid, due, as_of);

    conn.execute(
        "UPDATE fees
         SET paid_minor = ?, status = ?, payment_date = ?, payment_method = ?,
             transaction_id = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id = ?",
        rusqlite::params![
            paid,
            status.as_str(),
            fees::format_date(as_of),
            method.as_str(),
            transaction_id,
            fee_id,
        ],
    )
    .map_err(db_err("db_update_failed"))?;
    tracing::info!(fee = %fee_id, paid_minor = paid, status = status.as_str(), "payment recorded");

    Ok(json!({
        "ok": true,
        "status": status.as_str(),
        "paidAmount": fees::from_minor(paid),
        "balance": fees::from_minor(fee.amount_minor - paid),
    }))
}

fn fees_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let fee_id = get_required_str(params, "feeId")?;
    let patch = get_patch(params)?;
    let as_of = get_as_of(params)?;
    let mut fee = load_fee(conn, &fee_id)?;
    let patch_value = Value::Object(patch.clone());

    if let Some(v) = get_money(&patch_value, "amount")? {
        if v <= 0 {
            return Err(HandlerErr::bad_params("amount must be greater than 0"));
        }
        fee.amount_minor = v;
    }
    if let Some(v) = get_money(&patch_value, "paidAmount")? {
        fee.paid_minor = v;
    }
    if fee.paid_minor > fee.amount_minor {
        return Err(overpayment(fee.amount_minor));
    }
    if let Some(d) = get_date(&patch_value, "dueDate")? {
        fee.due_date = fees::format_date(d);
    }
    for (key, slot) in [
        ("academicYear", &mut fee.academic_year),
        ("feeYear", &mut fee.fee_year),
    ] {
        if patch.contains_key(key) {
            *slot = get_opt_str(&patch_value, key)
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must not be empty", key)))?;
        }
    }
    if patch.contains_key("remarks") {
        fee.remarks = get_opt_str(&patch_value, "remarks");
    }
    if patch.contains_key("paymentMethod") {
        fee.payment_method = match get_opt_str(&patch_value, "paymentMethod") {
            Some(raw) => Some(parse_method(Some(raw), conn)?.as_str().to_string()),
            None => None,
        };
    }
    if patch.contains_key("transactionId") {
        fee.transaction_id = get_opt_str(&patch_value, "transactionId");
    }
    if fee.paid_minor > 0 {
        if let Some(m) = fee.payment_method.as_deref().and_then(PaymentMethod::parse) {
            require_transaction_id(m, &fee.transaction_id)?;
        }
    }

    let due = fees::parse_date(&fee.due_date).unwrap_or(as_of);
    let status = fees::derive_status(fee.amount_minor, fee.paid_minor, due, as_of);
    conn.execute(
        "UPDATE fees
         SET academic_year = ?, fee_year = ?, amount_minor = ?, paid_minor = ?, status = ?,
             due_date = ?, payment_method = ?, transaction_id = ?, remarks = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id = ?",
        rusqlite::params![
            fee.academic_year,
            fee.fee_year,
            fee.amount_minor,
            fee.paid_minor,
            status.as_str(),
            fee.due_date,
            fee.payment_method,
            fee.transaction_id,
            fee.remarks,
            fee_id,
        ],
    )
    .map_err(db_err("db_update_failed"))?;

    Ok(json!({ "ok": true, "status": status.as_str() }))
}

fn fees_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let fee_id = get_required_str(params, "feeId")?;
    let n = conn
        .execute("DELETE FROM fees WHERE id = ?", [&fee_id])
        .map_err(db_err("db_delete_failed"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("fee"));
    }
    Ok(json!({ "ok": true }))
}

fn fees_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let as_of = get_as_of(params)?;
    let student = match get_opt_str(params, "studentId") {
        Some(key) => Some(students::resolve_student_id(conn, &key)?),
        None => None,
    };
    let status_filter = match get_opt_str(params, "status") {
        Some(raw) => Some(
            FeeStatus::parse(&raw)
                .ok_or_else(|| HandlerErr::bad_params("unknown fee status"))?,
        ),
        None => None,
    };
    let academic_year = get_opt_str(params, "academicYear");

    let rows = load_fees(conn, student.as_deref())?;
    let out: Vec<Value> = rows
        .iter()
        .filter(|f| status_filter.map_or(true, |s| f.effective_status(as_of) == s))
        .filter(|f| {
            academic_year
                .as_deref()
                .map_or(true, |y| f.academic_year == y)
        })
        .map(|f| f.to_json(as_of))
        .collect();
    Ok(json!({ "fees": out, "asOf": fees::format_date(as_of) }))
}

fn fees_sweep_statuses(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let as_of = get_as_of(params)?;
    let rows = load_fees(conn, None)?;
    let changed = in_tx(conn, |tx| {
        let mut changed = 0usize;
        for f in &rows {
            let status = f.effective_status(as_of);
            if status.as_str() == f.status {
                continue;
            }
            tx.execute(
                "UPDATE fees SET status = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
                 WHERE id = ?",
                (status.as_str(), &f.id),
            )
            .map_err(db_err("db_update_failed"))?;
            changed += 1;
        }
        Ok(changed)
    })?;
    tracing::info!(total = rows.len(), changed, as_of = %as_of, "fee statuses swept");
    Ok(json!({
        "total": rows.len(),
        "changed": changed,
        "asOf": fees::format_date(as_of),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "fees.create" => Some(with_db(state, req, fees_create)),
        "fees.recordPayment" => Some(with_db(state, req, fees_record_payment)),
        "fees.update" => Some(with_db(state, req, fees_update)),
        "fees.delete" => Some(with_db(state, req, fees_delete)),
        "fees.list" => Some(with_db(state, req, fees_list)),
        "fees.sweepStatuses" => Some(with_db(state, req, fees_sweep_statuses)),
        _ => None,
    }
}
