mod test_support;

use serde_json::json;
use test_support::{request_err, request_ok, seed_student, spawn_sidecar, temp_dir};

const AS_OF: &str = "2026-03-10";

#[test]
fn invoice_renders_text_and_html_with_branding() {
    let workspace = temp_dir("hostel-invoice");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({
            "section": "invoice",
            "patch": { "institutionName": "Riverside Hostel", "footer": "Fees once paid are not refundable." },
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "rooms.create",
        json!({ "roomNumber": "B-12", "capacity": 2 }),
    );
    let s = seed_student(&mut stdin, &mut reader, "INV7", "Neha <N>");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.allot",
        json!({ "studentId": s, "roomNumber": "B-12" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "fees.create",
        json!({
            "studentId": "INV7",
            "academicYear": "2025-2026",
            "feeYear": "2nd Year",
            "amount": 1000,
            "paidAmount": 400,
            "paymentMethod": "cash",
            "dueDate": "2026-03-01",
            "asOf": AS_OF,
        }),
    );

    let text = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "reports.invoice",
        json!({ "studentId": "INV7", "asOf": AS_OF }),
    );
    assert_eq!(
        text.get("invoiceNumber").and_then(|v| v.as_str()),
        Some("INV-INV7-2026-03-10")
    );
    assert_eq!(text.get("balance").and_then(|v| v.as_f64()), Some(600.0));
    let doc = text.get("document").and_then(|v| v.as_str()).expect("document");
    assert!(doc.starts_with("RIVERSIDE HOSTEL\nINVOICE\n"));
    assert!(doc.contains("Room: B-12"));
    assert!(doc.contains("Status: partial"));
    assert!(doc.contains("Balance: ₹600.00"));
    assert!(doc.contains("Fees once paid are not refundable."));

    let out = workspace.join("invoice.html");
    let html = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "reports.invoice",
        json!({
            "studentId": s,
            "format": "html",
            "outPath": out.to_string_lossy(),
            "asOf": AS_OF,
        }),
    );
    assert_eq!(html.get("format").and_then(|v| v.as_str()), Some("html"));
    let written = std::fs::read_to_string(&out).expect("read invoice file");
    assert!(written.contains("<h2>Riverside Hostel</h2>"));
    assert!(written.contains("Neha &lt;N&gt;"));

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "8",
            "reports.invoice",
            json!({ "studentId": s, "format": "pdf" }),
        ),
        "bad_params"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "9",
            "reports.invoice",
            json!({ "studentId": "NOPE" }),
        ),
        "not_found"
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn dashboard_stats_aggregate_rooms_and_dues() {
    let workspace = temp_dir("hostel-dashboard");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let empty = request_ok(&mut stdin, &mut reader, "2", "dashboard.stats", json!({}));
    assert_eq!(empty.get("occupancyRate").and_then(|v| v.as_f64()), Some(0.0));

    for (i, rn) in ["C-1", "C-2"].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("r{}", i),
            "rooms.create",
            json!({ "roomNumber": rn, "capacity": 3 }),
        );
    }
    let a = seed_student(&mut stdin, &mut reader, "DS1", "Om");
    let _ = seed_student(&mut stdin, &mut reader, "DS2", "Pia");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.allot",
        json!({ "studentId": a, "roomNumber": "C-1" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "fees.create",
        json!({
            "studentId": a,
            "academicYear": "2025-2026",
            "feeYear": "2nd Year",
            "amount": 1500,
            "paidAmount": 500,
            "paymentMethod": "cash",
            "dueDate": "2026-04-01",
            "asOf": AS_OF,
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "fees.create",
        json!({
            "studentId": "DS2",
            "academicYear": "2025-2026",
            "feeYear": "2nd Year",
            "amount": 800,
            "dueDate": "2026-03-01",
            "asOf": AS_OF,
        }),
    );

    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "dashboard.stats",
        json!({ "asOf": AS_OF }),
    );
    assert_eq!(stats.get("totalStudents").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(stats.get("assignedStudents").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(stats.get("totalRooms").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(stats.get("totalCapacity").and_then(|v| v.as_i64()), Some(6));
    assert_eq!(stats.get("occupancyRate").and_then(|v| v.as_f64()), Some(16.7));
    assert_eq!(stats.get("feesCollected").and_then(|v| v.as_f64()), Some(500.0));
    assert_eq!(stats.get("pendingDues").and_then(|v| v.as_f64()), Some(1800.0));
    assert_eq!(stats.get("overdueFees").and_then(|v| v.as_u64()), Some(1));

    let _ = std::fs::remove_dir_all(workspace);
}
