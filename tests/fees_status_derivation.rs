mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_err, request_ok, seed_student, spawn_sidecar, temp_dir};

const AS_OF: &str = "2026-03-10";

fn create_fee(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student: &str,
    paid: f64,
    due: &str,
) -> (String, String) {
    let created = request_ok(
        stdin,
        reader,
        id,
        "fees.create",
        json!({
            "studentId": student,
            "academicYear": "2025-2026",
            "feeYear": "2nd Year",
            "amount": 1000,
            "paidAmount": paid,
            "dueDate": due,
            "asOf": AS_OF,
        }),
    );
    (
        created
            .get("feeId")
            .and_then(|v| v.as_str())
            .expect("feeId")
            .to_string(),
        created
            .get("status")
            .and_then(|v| v.as_str())
            .expect("status")
            .to_string(),
    )
}

#[test]
fn derivation_table_on_create() {
    let workspace = temp_dir("hostel-fees-derive");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = seed_student(&mut stdin, &mut reader, "F1", "Farah");

    let (_, overdue) = create_fee(&mut stdin, &mut reader, "2", &s, 0.0, "2026-03-09");
    let (_, pending) = create_fee(&mut stdin, &mut reader, "3", &s, 0.0, "2026-03-11");
    let (_, due_today) = create_fee(&mut stdin, &mut reader, "4", &s, 0.0, AS_OF);
    let (_, paid) = create_fee(&mut stdin, &mut reader, "5", &s, 1000.0, "2026-03-09");
    assert_eq!(overdue, "overdue");
    assert_eq!(pending, "pending");
    assert_eq!(due_today, "pending");
    assert_eq!(paid, "paid");

    // Non-cash partial payment needs a reference.
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "6",
            "fees.create",
            json!({
                "studentId": s,
                "academicYear": "2025-2026",
                "feeYear": "2nd Year",
                "amount": 1000,
                "paidAmount": 400,
                "paymentMethod": "upi",
                "dueDate": "2026-03-09",
                "asOf": AS_OF,
            }),
        ),
        "bad_params"
    );
    let partial = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "fees.create",
        json!({
            "studentId": s,
            "academicYear": "2025-2026",
            "feeYear": "2nd Year",
            "amount": 1000,
            "paidAmount": 400,
            "paymentMethod": "upi",
            "transactionId": "UPI-42",
            "dueDate": "2026-03-09",
            "asOf": AS_OF,
        }),
    );
    assert_eq!(partial.get("status").and_then(|v| v.as_str()), Some("partial"));

    // Client-supplied status is ignored.
    let forced = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "fees.create",
        json!({
            "studentId": s,
            "academicYear": "2025-2026",
            "feeYear": "2nd Year",
            "amount": 500,
            "dueDate": "2026-03-01",
            "status": "paid",
            "asOf": AS_OF,
        }),
    );
    assert_eq!(forced.get("status").and_then(|v| v.as_str()), Some("overdue"));

    let overdue_list = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "fees.list",
        json!({ "studentId": s, "status": "overdue", "asOf": AS_OF }),
    );
    assert_eq!(
        overdue_list.get("fees").and_then(|v| v.as_array()).map(|v| v.len()),
        Some(2)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn payments_accumulate_and_reject_overpayment() {
    let workspace = temp_dir("hostel-fees-payments");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = seed_student(&mut stdin, &mut reader, "G1", "Gopal");
    let (fee, status) = create_fee(&mut stdin, &mut reader, "2", &s, 0.0, "2026-03-09");
    assert_eq!(status, "overdue");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "fees.recordPayment",
        json!({ "feeId": fee, "amount": 400, "paymentMethod": "cash", "asOf": AS_OF }),
    );
    assert_eq!(first.get("status").and_then(|v| v.as_str()), Some("partial"));
    assert_eq!(first.get("balance").and_then(|v| v.as_f64()), Some(600.0));

    let over = test_support::request(
        &mut stdin,
        &mut reader,
        "4",
        "fees.recordPayment",
        json!({ "feeId": fee, "amount": 600.01, "paymentMethod": "cash", "asOf": AS_OF }),
    );
    assert_eq!(over.pointer("/error/code").and_then(|v| v.as_str()), Some("overpayment"));
    assert_eq!(
        over.pointer("/error/details/outstanding").and_then(|v| v.as_f64()),
        Some(600.0)
    );

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "5",
            "fees.recordPayment",
            json!({ "feeId": fee, "amount": 600, "paymentMethod": "bank_transfer", "asOf": AS_OF }),
        ),
        "bad_params"
    );

    let settled = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "fees.recordPayment",
        json!({
            "feeId": fee,
            "amount": 600,
            "paymentMethod": "bank_transfer",
            "transactionId": "NEFT-7",
            "asOf": AS_OF,
        }),
    );
    assert_eq!(settled.get("status").and_then(|v| v.as_str()), Some("paid"));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.get",
        json!({ "studentId": s, "asOf": AS_OF }),
    );
    assert_eq!(
        got.pointer("/student/feeSummary").and_then(|v| v.as_str()),
        Some("Paid")
    );
    assert_eq!(
        got.pointer("/student/fees/0/paymentDate").and_then(|v| v.as_str()),
        Some(AS_OF)
    );
    assert_eq!(
        got.pointer("/student/fees/0/paymentMethod").and_then(|v| v.as_str()),
        Some("bank_transfer")
    );

    // Lowering the amount below what was paid is refused.
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "8",
            "fees.update",
            json!({ "feeId": fee, "patch": { "amount": 900 } }),
        ),
        "overpayment"
    );
    let raised = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "fees.update",
        json!({ "feeId": fee, "patch": { "amount": 1200 }, "asOf": AS_OF }),
    );
    assert_eq!(raised.get("status").and_then(|v| v.as_str()), Some("partial"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn sweep_persists_time_based_transitions_and_delete_cascades() {
    let workspace = temp_dir("hostel-fees-sweep");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = seed_student(&mut stdin, &mut reader, "H1", "Hema");
    let (_, status) = create_fee(&mut stdin, &mut reader, "2", &s, 0.0, "2026-03-15");
    assert_eq!(status, "pending");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "fees.list",
        json!({ "studentId": s, "asOf": "2026-03-20" }),
    );
    assert_eq!(
        listed.pointer("/fees/0/status").and_then(|v| v.as_str()),
        Some("pending")
    );
    assert_eq!(
        listed.pointer("/fees/0/effectiveStatus").and_then(|v| v.as_str()),
        Some("overdue")
    );

    let swept = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "fees.sweepStatuses",
        json!({ "asOf": "2026-03-20" }),
    );
    assert_eq!(swept.get("changed").and_then(|v| v.as_u64()), Some(1));
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "fees.sweepStatuses",
        json!({ "asOf": "2026-03-20" }),
    );
    assert_eq!(again.get("changed").and_then(|v| v.as_u64()), Some(0));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.delete",
        json!({ "studentId": s }),
    );
    let all = request_ok(&mut stdin, &mut reader, "7", "fees.list", json!({}));
    assert_eq!(
        all.get("fees").and_then(|v| v.as_array()).map(|v| v.len()),
        Some(0)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn oversized_amounts_are_rejected_and_totals_stay_served() {
    let workspace = temp_dir("hostel-fees-ceiling");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = seed_student(&mut stdin, &mut reader, "BIG1", "Bilal");

    for (i, amount) in [1e17, 1e13].into_iter().enumerate() {
        assert_eq!(
            request_err(
                &mut stdin,
                &mut reader,
                &format!("c{}", i),
                "fees.create",
                json!({
                    "studentId": s,
                    "academicYear": "2025-2026",
                    "feeYear": "1st Year",
                    "amount": amount,
                    "paidAmount": amount,
                    "dueDate": AS_OF,
                }),
            ),
            "bad_params"
        );
    }

    // Two fees at the ceiling still sum without overflow.
    for id in ["m1", "m2"] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "fees.create",
            json!({
                "studentId": s,
                "academicYear": "2025-2026",
                "feeYear": "1st Year",
                "amount": 1e12,
                "paidAmount": 1e12,
                "dueDate": AS_OF,
            }),
        );
    }
    let stats = request_ok(&mut stdin, &mut reader, "s", "dashboard.stats", json!({}));
    assert_eq!(
        stats.get("feesCollected").and_then(|v| v.as_f64()),
        Some(2e12)
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "inv",
        "reports.invoice",
        json!({ "studentId": "BIG1", "format": "text" }),
    );

    let _ = std::fs::remove_dir_all(workspace);
}
