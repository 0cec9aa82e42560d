mod test_support;

use serde_json::json;
use test_support::{request_ok, seed_student, spawn_sidecar, temp_dir};

#[test]
fn csv_export_reimports_quoted_fields_into_a_fresh_workspace() {
    let src = temp_dir("hostel-csv-src");
    let dst = temp_dir("hostel-csv-dst");
    let out = temp_dir("hostel-csv-out");
    let rooms_csv = out.join("rooms.csv");
    let students_csv = out.join("students.csv");
    let tricky_name = "Doe, Jane \"JJ\"";
    let tricky_address = "12 Main St\nFlat 3, Block \"B\"";

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": src.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "rooms.create",
        json!({ "roomNumber": "Q-1", "capacity": 1 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "studentId": "CSV1",
            "name": tricky_name,
            "gender": "female",
            "phone": "9876543210",
            "year": 2,
            "address": tricky_address,
            "roomNumber": "Q-1",
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "data.exportCsv",
        json!({ "table": "rooms", "outPath": rooms_csv.to_string_lossy() }),
    );
    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "data.exportCsv",
        json!({ "table": "students", "outPath": students_csv.to_string_lossy() }),
    );
    assert_eq!(exported.get("rowsExported").and_then(|v| v.as_u64()), Some(1));

    let text = std::fs::read_to_string(&students_csv).expect("read students csv");
    assert!(text.starts_with("student_id,name,gender,phone"));
    assert!(text.contains("\"Doe, Jane \"\"JJ\"\"\""));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "workspace.select",
        json!({ "path": dst.to_string_lossy() }),
    );
    let rooms = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "data.importCsv",
        json!({ "table": "rooms", "path": rooms_csv.to_string_lossy() }),
    );
    assert_eq!(rooms.get("inserted").and_then(|v| v.as_u64()), Some(1));
    let students = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "data.importCsv",
        json!({ "table": "students", "path": students_csv.to_string_lossy() }),
    );
    assert_eq!(students.get("inserted").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(students.get("skipped").and_then(|v| v.as_u64()), Some(0));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.get",
        json!({ "studentId": "CSV1" }),
    );
    assert_eq!(
        got.pointer("/student/name").and_then(|v| v.as_str()),
        Some(tricky_name)
    );
    assert_eq!(
        got.pointer("/student/address").and_then(|v| v.as_str()),
        Some(tricky_address)
    );
    assert_eq!(
        got.pointer("/student/roomNumber").and_then(|v| v.as_str()),
        Some("Q-1")
    );

    // Import reconciled the room it filled.
    let listed = request_ok(&mut stdin, &mut reader, "10", "rooms.list", json!({}));
    assert_eq!(
        listed.pointer("/rooms/0/status").and_then(|v| v.as_str()),
        Some("full")
    );

    // Re-importing the same file updates in place.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "data.importCsv",
        json!({ "table": "students", "path": students_csv.to_string_lossy() }),
    );
    assert_eq!(again.get("inserted").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(again.get("updated").and_then(|v| v.as_u64()), Some(1));

    let _ = std::fs::remove_dir_all(src);
    let _ = std::fs::remove_dir_all(dst);
    let _ = std::fs::remove_dir_all(out);
}

#[test]
fn bad_rows_are_skipped_with_line_numbers() {
    let workspace = temp_dir("hostel-csv-bad");
    let csv = workspace.join("students.csv");
    std::fs::write(
        &csv,
        "student_id,name,gender,phone,year\r\n\
         OK1,Good Row,male,9876543210,1\r\n\
         BAD1,Bad Year,male,9876543210,9\r\n\
         ,No Id,female,9876543210,2\r\n",
    )
    .expect("write csv");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "data.importCsv",
        json!({ "table": "students", "path": csv.to_string_lossy() }),
    );
    assert_eq!(result.get("inserted").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(result.get("skipped").and_then(|v| v.as_u64()), Some(2));
    let lines: Vec<i64> = result
        .get("warnings")
        .and_then(|v| v.as_array())
        .expect("warnings")
        .iter()
        .filter_map(|w| w.get("line").and_then(|v| v.as_i64()))
        .collect();
    assert_eq!(lines, vec![3, 4]);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn json_backup_restores_directory_tables() {
    let src = temp_dir("hostel-json-src");
    let dst = temp_dir("hostel-json-dst");
    let backup = src.join("backup.json");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": src.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "departments.create",
        json!({ "code": "ME", "name": "Mechanical" }),
    );
    let written = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "data.backupJson",
        json!({ "outPath": backup.to_string_lossy() }),
    );
    assert_eq!(written.pointer("/counts/departments").and_then(|v| v.as_u64()), Some(1));

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&backup).expect("read backup"))
            .expect("backup json");
    for key in ["students", "rooms", "departments", "colleges", "fees"] {
        assert!(doc.get(key).map_or(false, |v| v.is_array()), "missing {}", key);
    }

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.select",
        json!({ "path": dst.to_string_lossy() }),
    );
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "data.importJson",
        json!({ "table": "departments", "path": backup.to_string_lossy() }),
    );
    assert_eq!(imported.get("inserted").and_then(|v| v.as_u64()), Some(1));
    let listed = request_ok(&mut stdin, &mut reader, "6", "departments.list", json!({}));
    assert_eq!(
        listed.pointer("/departments/0/name").and_then(|v| v.as_str()),
        Some("Mechanical")
    );

    let _ = std::fs::remove_dir_all(src);
    let _ = std::fs::remove_dir_all(dst);
}

#[test]
fn warning_lines_follow_multi_line_records() {
    let workspace = temp_dir("hostel-csv-lines");
    let csv = workspace.join("students.csv");
    std::fs::write(
        &csv,
        "student_id,name,gender,phone,year,address\n\
         ML1,Meera,female,9876543210,1,\"4 Lake View\nBlock C\nPune\"\n\
         \n\
         ML2,Late Row,male,9876543210,7,\n",
    )
    .expect("write csv");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "data.importCsv",
        json!({ "table": "students", "path": csv.to_string_lossy() }),
    );
    assert_eq!(result.get("inserted").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(
        result.pointer("/warnings/0/line").and_then(|v| v.as_i64()),
        Some(6)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn json_backup_restores_fees_with_rederived_status() {
    let src = temp_dir("hostel-json-fees-src");
    let dst = temp_dir("hostel-json-fees-dst");
    let backup = src.join("backup.json");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": src.to_string_lossy() }),
    );
    let _ = seed_student(&mut stdin, &mut reader, "FEE1", "Kiran");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "fees.create",
        json!({
            "studentId": "FEE1",
            "academicYear": "2025-2026",
            "feeYear": "1st Year",
            "amount": 1500,
            "paidAmount": 500,
            "paymentMethod": "upi",
            "transactionId": "UPI-778",
            "dueDate": "2026-04-01",
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "fees.create",
        json!({
            "studentId": "FEE1",
            "academicYear": "2025-2026",
            "feeYear": "2nd Year",
            "amount": 1200,
            "dueDate": "2026-01-15",
            "asOf": "2026-01-01",
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "data.backupJson",
        json!({ "outPath": backup.to_string_lossy() }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "workspace.select",
        json!({ "path": dst.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "data.importJson",
        json!({ "table": "students", "path": backup.to_string_lossy() }),
    );
    let restored = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "data.importJson",
        json!({ "table": "fees", "path": backup.to_string_lossy(), "asOf": "2026-03-10" }),
    );
    assert_eq!(restored.get("inserted").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(restored.get("skipped").and_then(|v| v.as_u64()), Some(0));

    let again = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "data.importJson",
        json!({ "table": "fees", "path": backup.to_string_lossy(), "asOf": "2026-03-10" }),
    );
    assert_eq!(again.get("inserted").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(again.get("updated").and_then(|v| v.as_u64()), Some(2));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "fees.list",
        json!({ "studentId": "FEE1", "asOf": "2026-03-10" }),
    );
    let fees = listed.get("fees").and_then(|v| v.as_array()).expect("fees");
    assert_eq!(fees.len(), 2);
    let by_year = |year: &str| {
        fees.iter()
            .find(|f| f.get("feeYear").and_then(|v| v.as_str()) == Some(year))
            .cloned()
            .expect("fee for year")
    };
    let first = by_year("1st Year");
    assert_eq!(first.get("paidAmount").and_then(|v| v.as_f64()), Some(500.0));
    assert_eq!(first.get("status").and_then(|v| v.as_str()), Some("partial"));
    assert_eq!(first.get("transactionId").and_then(|v| v.as_str()), Some("UPI-778"));
    // Stored as pending in the source; due date has passed by the import date.
    let second = by_year("2nd Year");
    assert_eq!(second.get("status").and_then(|v| v.as_str()), Some("overdue"));

    let _ = std::fs::remove_dir_all(src);
    let _ = std::fs::remove_dir_all(dst);
}
