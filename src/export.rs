use crate::fees::format_money;

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn write_csv(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut out = headers
        .iter()
        .map(|h| csv_quote(h))
        .collect::<Vec<_>>()
        .join(",");
    out.push('\n');
    for row in rows {
        out.push_str(
            &row.iter()
                .map(|v| csv_quote(v))
                .collect::<Vec<_>>()
                .join(","),
        );
        out.push('\n');
    }
    out
}

/// Parses a whole CSV document. Quoted fields may hold commas, doubled
/// quotes and line breaks. Blank lines between records are dropped.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    parse_csv_numbered(text)
        .into_iter()
        .map(|(_, record)| record)
        .collect()
}

/// Like [`parse_csv`], paired with the 1-based line each record starts on.
pub fn parse_csv_numbered(text: &str) -> Vec<(usize, Vec<String>)> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut start = 1;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => {
                    if ch == '\n' {
                        line += 1;
                    }
                    field.push(ch);
                }
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if record.len() == 1 && record[0].is_empty() {
                    record.clear();
                } else {
                    records.push((start, std::mem::take(&mut record)));
                }
                line += 1;
                start = line;
            }
            _ => field.push(ch),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push((start, record));
    }
    records
}

/// Data rows as `(header, value)` maps with their starting line. Missing
/// trailing cells come back as empty strings.
pub fn csv_objects(text: &str) -> Vec<(usize, Vec<(String, String)>)> {
    let mut records = parse_csv_numbered(text).into_iter();
    let Some((_, headers)) = records.next() else {
        return Vec::new();
    };
    let headers: Vec<String> = headers
        .into_iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
        .collect();
    records
        .map(|(line, rec)| {
            let obj = headers
                .iter()
                .enumerate()
                .map(|(i, h)| (h.clone(), rec.get(i).cloned().unwrap_or_default()))
                .collect();
            (line, obj)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct InvoiceFee {
    pub academic_year: String,
    pub fee_year: String,
    pub amount_minor: i64,
    pub paid_minor: i64,
    pub status: String,
    pub due_date: String,
    pub payment_date: Option<String>,
    pub payment_method: Option<String>,
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Invoice {
    pub institution: String,
    pub footer: String,
    pub currency: String,
    pub student_name: String,
    pub student_id: String,
    pub college: Option<String>,
    pub department: Option<String>,
    pub room_number: Option<String>,
    pub generated_on: String,
    pub fees: Vec<InvoiceFee>,
}

impl Invoice {
    pub fn number(&self) -> String {
        format!("INV-{}-{}", self.student_id, self.generated_on)
    }

    pub fn total_minor(&self) -> i64 {
        self.fees
            .iter()
            .fold(0i64, |acc, f| acc.saturating_add(f.amount_minor))
    }

    pub fn paid_minor(&self) -> i64 {
        self.fees
            .iter()
            .fold(0i64, |acc, f| acc.saturating_add(f.paid_minor))
    }
}

pub fn render_invoice_text(inv: &Invoice) -> String {
    let money = |m: i64| format_money(m, &inv.currency);
    let mut out = String::new();
    out.push_str(&inv.institution.to_uppercase());
    out.push_str("\nINVOICE\n");
    out.push_str(&format!("Invoice ID: {}\n\n", inv.number()));
    out.push_str("Student Details:\n");
    out.push_str(&format!("Name: {}\n", inv.student_name));
    out.push_str(&format!("ID: {}\n", inv.student_id));
    out.push_str(&format!("College: {}\n", inv.college.as_deref().unwrap_or("N/A")));
    out.push_str(&format!(
        "Department: {}\n",
        inv.department.as_deref().unwrap_or("N/A")
    ));
    out.push_str(&format!(
        "Room: {}\n",
        inv.room_number.as_deref().unwrap_or("Not Assigned")
    ));
    out.push_str("\nFee Details:\n");
    if inv.fees.is_empty() {
        out.push_str("No fee records.\n");
    }
    for fee in &inv.fees {
        out.push('\n');
        out.push_str(&format!("Academic Year: {}\n", fee.academic_year));
        out.push_str(&format!("Fee Year: {}\n", fee.fee_year));
        out.push_str(&format!("Amount: {}\n", money(fee.amount_minor)));
        out.push_str(&format!("Paid Amount: {}\n", money(fee.paid_minor)));
        out.push_str(&format!(
            "Balance: {}\n",
            money(fee.amount_minor - fee.paid_minor)
        ));
        out.push_str(&format!("Status: {}\n", fee.status));
        out.push_str(&format!("Due Date: {}\n", fee.due_date));
        out.push_str(&format!(
            "Payment Date: {}\n",
            fee.payment_date.as_deref().unwrap_or("Not Paid")
        ));
        out.push_str(&format!(
            "Payment Method: {}\n",
            fee.payment_method.as_deref().unwrap_or("N/A")
        ));
        out.push_str(&format!(
            "Transaction ID: {}\n",
            fee.transaction_id.as_deref().unwrap_or("N/A")
        ));
    }
    out.push_str(&format!(
        "\nTotal: {}\nPaid: {}\nBalance: {}\n",
        money(inv.total_minor()),
        money(inv.paid_minor()),
        money(inv.total_minor() - inv.paid_minor())
    ));
    out.push_str(&format!("\nGenerated on: {}\n", inv.generated_on));
    if !inv.footer.is_empty() {
        out.push_str(&inv.footer);
        out.push('\n');
    }
    out
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Print-ready page; the shell opens it and triggers the print dialog.
pub fn render_invoice_html(inv: &Invoice) -> String {
    let money = |m: i64| html_escape(&format_money(m, &inv.currency));
    let cell = "padding:8px;border:1px solid #e5e7eb";
    let mut rows = String::new();
    for fee in &inv.fees {
        rows.push_str(&format!(
            "<tr><td style=\"{c}\">{}</td><td style=\"{c}\">{}</td><td style=\"{c}\">{}</td>\
             <td style=\"{c}\">{}</td><td style=\"{c}\">{}</td><td style=\"{c}\">{}</td>\
             <td style=\"{c}\">{}</td><td style=\"{c}\">{}</td></tr>\n",
            html_escape(&fee.academic_year),
            html_escape(&fee.fee_year),
            money(fee.amount_minor),
            money(fee.paid_minor),
            money(fee.amount_minor - fee.paid_minor),
            html_escape(&fee.status),
            html_escape(&fee.due_date),
            html_escape(fee.payment_date.as_deref().unwrap_or("-")),
            c = cell,
        ));
    }

    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>Invoice - {sid}</title></head>\n\
         <body style=\"font-family:sans-serif;margin:24px\">\n\
         <h2>{inst}</h2>\n<div><strong>Invoice</strong></div>\n<div>Invoice ID: {num}</div>\n\
         <div>Date: {date}</div>\n<hr>\n\
         <div>Name: {name}</div>\n<div>ID: {sid}</div>\n<div>College: {college}</div>\n\
         <div>Department: {dept}</div>\n\
         <table style=\"border-collapse:collapse;margin-top:16px\">\n\
         <tr><th>Academic Year</th><th>Fee Year</th><th>Amount</th><th>Paid</th><th>Balance</th>\
         <th>Status</th><th>Due Date</th><th>Payment Date</th></tr>\n{rows}</table>\n\
         <p>Total: {total} &middot; Paid: {paid} &middot; Balance: {balance}</p>\n\
         <div style=\"margin-top:24px;font-size:12px;color:#6b7280\">{footer}</div>\n\
         </body></html>\n",
        sid = html_escape(&inv.student_id),
        inst = html_escape(&inv.institution),
        num = html_escape(&inv.number()),
        date = html_escape(&inv.generated_on),
        name = html_escape(&inv.student_name),
        college = html_escape(inv.college.as_deref().unwrap_or("N/A")),
        dept = html_escape(inv.department.as_deref().unwrap_or("N/A")),
        rows = rows,
        total = money(inv.total_minor()),
        paid = money(inv.paid_minor()),
        balance = money(inv.total_minor() - inv.paid_minor()),
        footer = html_escape(&inv.footer),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_only_when_needed() {
        assert_eq!(csv_quote("plain"), "plain");
        assert_eq!(csv_quote("a,b"), "\"a,b\"");
        assert_eq!(csv_quote("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn embedded_comma_quote_and_newline_survive() {
        let tricky = "Flat 4, \"Rose\" Villa\nMG Road";
        let csv = write_csv(
            &["student_id", "address"],
            &[vec!["S1".into(), tricky.into()], vec!["S2".into(), "".into()]],
        );
        let parsed = parse_csv(&csv);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1], vec!["S1".to_string(), tricky.to_string()]);
        assert_eq!(parsed[2], vec!["S2".to_string(), String::new()]);
    }

    #[test]
    fn crlf_and_missing_final_newline() {
        let parsed = parse_csv("a,b\r\n1,2\r\n\r\n3,4");
        assert_eq!(parsed, vec![vec!["a", "b"], vec!["1", "2"], vec!["3", "4"]]);
    }

    #[test]
    fn objects_pad_short_rows() {
        let objs = csv_objects("\u{feff}code,name\nCS\n");
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].0, 2);
        assert_eq!(objs[0].1[0], ("code".to_string(), "CS".to_string()));
        assert_eq!(objs[0].1[1], ("name".to_string(), String::new()));
    }

    #[test]
    fn records_remember_their_first_line() {
        let text = "id,address\nA,\"12 Hill Rd\nFlat 3\"\n\nB,x\r\nC,y";
        let starts: Vec<usize> = parse_csv_numbered(text).iter().map(|(l, _)| *l).collect();
        assert_eq!(starts, vec![1, 2, 5, 6]);
    }

    fn sample_invoice() -> Invoice {
        Invoice {
            institution: "Hostel Management System".into(),
            footer: "Thank you".into(),
            currency: "₹".into(),
            student_name: "Asha <K>".into(),
            student_id: "S-1".into(),
            college: Some("PIM".into()),
            department: None,
            room_number: Some("A-101".into()),
            generated_on: "2026-03-10".into(),
            fees: vec![InvoiceFee {
                academic_year: "2025-26".into(),
                fee_year: "1".into(),
                amount_minor: 100_000,
                paid_minor: 40_000,
                status: "partial".into(),
                due_date: "2026-04-01".into(),
                payment_date: Some("2026-03-01".into()),
                payment_method: Some("upi".into()),
                transaction_id: Some("TX9".into()),
            }],
        }
    }

    #[test]
    fn text_invoice_lists_balances() {
        let text = render_invoice_text(&sample_invoice());
        assert!(text.starts_with("HOSTEL MANAGEMENT SYSTEM\nINVOICE\n"));
        assert!(text.contains("Invoice ID: INV-S-1-2026-03-10"));
        assert!(text.contains("Balance: ₹600.00"));
        assert!(text.contains("Department: N/A"));
        assert!(text.contains("Transaction ID: TX9"));
    }

    #[test]
    fn html_invoice_escapes_user_text() {
        let html = render_invoice_html(&sample_invoice());
        assert!(html.contains("Asha &lt;K&gt;"));
        assert!(!html.contains("<K>"));
        assert!(html.contains("Balance: ₹600.00"));
    }
}
