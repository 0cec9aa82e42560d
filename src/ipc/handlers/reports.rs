use crate::export::{self, Invoice, InvoiceFee};
use crate::fees::{self, FeeStatus};
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::handlers::{fees as fee_handlers, setup, students};
use crate::ipc::helpers::{get_as_of, get_opt_str, get_required_str, with_db};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

fn build_invoice(conn: &Connection, params: &Value) -> Result<Invoice, HandlerErr> {
    let key = get_required_str(params, "studentId")?;
    let id = students::resolve_student_id(conn, &key)?;
    let as_of = get_as_of(params)?;

    let (name, student_id, room_number, college, department) = conn
        .query_row(
            "SELECT s.name, s.student_id, s.room_number, c.name, d.name
             FROM students s
             LEFT JOIN colleges c ON c.id = s.college_id
             LEFT JOIN departments d ON d.id = s.department_id
             WHERE s.id = ?",
            [&id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .map_err(db_err("db_query_failed"))?;

    let fees = fee_handlers::load_fees(conn, Some(&id))?
        .into_iter()
        .map(|f| InvoiceFee {
            status: f.effective_status(as_of).as_str().to_string(),
            academic_year: f.academic_year,
            fee_year: f.fee_year,
            amount_minor: f.amount_minor,
            paid_minor: f.paid_minor,
            due_date: f.due_date,
            payment_date: f.payment_date,
            payment_method: f.payment_method,
            transaction_id: f.transaction_id,
        })
        .collect();

    let (institution, footer) = setup::invoice_branding(conn);
    Ok(Invoice {
        institution,
        footer,
        currency: setup::currency_symbol(conn),
        student_name: name,
        student_id,
        college,
        department,
        room_number,
        generated_on: fees::format_date(as_of),
        fees,
    })
}

fn reports_invoice(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let invoice = build_invoice(conn, params)?;
    let format = get_opt_str(params, "format").unwrap_or_else(|| "text".to_string());
    let document = match format.as_str() {
        "text" => export::render_invoice_text(&invoice),
        "html" => export::render_invoice_html(&invoice),
        other => {
            return Err(HandlerErr::bad_params(format!(
                "format must be text or html, got {}",
                other
            )))
        }
    };

    let out_path = get_opt_str(params, "outPath");
    if let Some(path) = out_path.as_deref() {
        std::fs::write(path, &document).map_err(|e| {
            HandlerErr::new("export_failed", e.to_string()).with_details(json!({ "path": path }))
        })?;
        tracing::info!(invoice = %invoice.number(), path, "invoice written");
    }

    Ok(json!({
        "invoiceNumber": invoice.number(),
        "format": format,
        "total": fees::from_minor(invoice.total_minor()),
        "paid": fees::from_minor(invoice.paid_minor()),
        "balance": fees::from_minor(invoice.total_minor() - invoice.paid_minor()),
        "path": out_path,
        "document": document,
    }))
}

fn dashboard_stats(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let as_of = get_as_of(params)?;
    let (active_students, assigned): (i64, i64) = conn
        .query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN room_number IS NOT NULL THEN 1 ELSE 0 END), 0)
             FROM students",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(db_err("db_query_failed"))?;
    let (room_count, total_capacity): (i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(capacity), 0) FROM rooms",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(db_err("db_query_failed"))?;

    let mut collected = 0i64;
    let mut pending = 0i64;
    let mut overdue = 0usize;
    for f in fee_handlers::load_fees(conn, None)? {
        collected = collected.saturating_add(f.paid_minor);
        pending = pending.saturating_add((f.amount_minor - f.paid_minor).max(0));
        if f.effective_status(as_of) == FeeStatus::Overdue {
            overdue += 1;
        }
    }
    let occupancy_rate = if total_capacity > 0 {
        (assigned as f64 * 1000.0 / total_capacity as f64).round() / 10.0
    } else {
        0.0
    };

    Ok(json!({
        "totalStudents": active_students,
        "assignedStudents": assigned,
        "totalRooms": room_count,
        "totalCapacity": total_capacity,
        "occupancyRate": occupancy_rate,
        "feesCollected": fees::from_minor(collected),
        "pendingDues": fees::from_minor(pending),
        "overdueFees": overdue,
        "currencySymbol": setup::currency_symbol(conn),
        "asOf": fees::format_date(as_of),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "reports.invoice" => Some(with_db(state, req, reports_invoice)),
        "dashboard.stats" => Some(with_db(state, req, dashboard_stats)),
        _ => None,
    }
}
