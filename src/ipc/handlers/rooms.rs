use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    get_bool, get_i64, get_patch, get_required_str, in_tx, patch_str, with_db,
};
use crate::ipc::types::{AppState, Request};
use crate::occupancy::{self, RoomStatus, RoomType};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

struct RoomRow {
    id: String,
    room_number: String,
    capacity: i64,
    floor_number: Option<i64>,
    room_type: String,
    status: String,
    occupancy: i64,
}

impl RoomRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "roomNumber": self.room_number,
            "capacity": self.capacity,
            "floorNumber": self.floor_number,
            "roomType": self.room_type,
            "status": self.status,
            "occupancy": self.occupancy,
            "freeSlots": occupancy::free_slots(self.occupancy, self.capacity),
            "overCapacity": self.occupancy > self.capacity,
        })
    }
}

const ROOM_SELECT: &str = "SELECT r.id, r.room_number, r.capacity, r.floor_number, r.room_type, r.status,
        (SELECT COUNT(*) FROM students s WHERE s.room_number = r.room_number)
     FROM rooms r";

fn map_room(r: &rusqlite::Row<'_>) -> rusqlite::Result<RoomRow> {
    Ok(RoomRow {
        id: r.get(0)?,
        room_number: r.get(1)?,
        capacity: r.get(2)?,
        floor_number: r.get(3)?,
        room_type: r.get(4)?,
        status: r.get(5)?,
        occupancy: r.get(6)?,
    })
}

fn load_rooms(conn: &Connection) -> Result<Vec<RoomRow>, HandlerErr> {
    let sql = format!("{} ORDER BY r.room_number", ROOM_SELECT);
    let mut stmt = conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([], map_room)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(rows)
}

fn load_room(conn: &Connection, room_number: &str) -> Result<Option<RoomRow>, HandlerErr> {
    let sql = format!("{} WHERE r.room_number = ?", ROOM_SELECT);
    conn.query_row(&sql, [room_number], map_room)
        .optional()
        .map_err(db_err("db_query_failed"))
}

fn students_in_room(conn: &Connection, room_number: &str) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, student_id, name FROM students WHERE room_number = ? ORDER BY name")
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([room_number], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(rows)
}

fn parse_capacity(v: i64) -> Result<i64, HandlerErr> {
    if v <= 0 {
        return Err(HandlerErr::bad_params("capacity must be greater than 0"));
    }
    Ok(v)
}

fn parse_room_type(raw: &str) -> Result<RoomType, HandlerErr> {
    RoomType::parse(raw)
        .ok_or_else(|| HandlerErr::bad_params("roomType must be one of: standard, deluxe, premium"))
}

// `full` is derived only; clients may place or lift a hold.
fn parse_requested_status(raw: &str) -> Result<RoomStatus, HandlerErr> {
    match RoomStatus::parse(raw) {
        Some(s @ (RoomStatus::Available | RoomStatus::Maintenance | RoomStatus::Blocked)) => Ok(s),
        _ => Err(HandlerErr::bad_params(
            "status must be one of: available, maintenance, blocked",
        )),
    }
}

fn rooms_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let include_students = get_bool(params, "includeStudents")?.unwrap_or(false);
    let rooms = load_rooms(conn)?;
    let mut out = Vec::with_capacity(rooms.len());
    for room in &rooms {
        let mut v = room.to_json();
        if include_students {
            v["students"] = Value::Array(students_in_room(conn, &room.room_number)?);
        }
        out.push(v);
    }
    Ok(json!({ "rooms": out }))
}

fn rooms_available(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let rooms = load_rooms(conn)?;
    let out: Vec<Value> = rooms
        .iter()
        .filter(|r| {
            let held = RoomStatus::parse(&r.status)
                .map(|s| s.is_manual_hold())
                .unwrap_or(false);
            !held && r.occupancy < r.capacity
        })
        .map(|r| r.to_json())
        .collect();
    Ok(json!({ "rooms": out }))
}

fn rooms_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let room_number = get_required_str(params, "roomNumber")?;
    let capacity = match get_i64(params, "capacity")? {
        Some(v) => parse_capacity(v)?,
        None => setup::rooms_default_capacity(conn),
    };
    let floor_number = get_i64(params, "floorNumber")?;
    let room_type = match params.get("roomType").and_then(|v| v.as_str()) {
        Some(raw) => parse_room_type(raw)?,
        None => RoomType::Standard,
    };
    let status = match params.get("status").and_then(|v| v.as_str()) {
        Some(raw) => parse_requested_status(raw)?,
        None => RoomStatus::Available,
    };

    let id = Uuid::new_v4().to_string();
    let reconciled = in_tx(conn, |tx| {
        tx.execute(
            "INSERT INTO rooms(id, room_number, capacity, floor_number, room_type, status, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'), strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
            (&id, &room_number, capacity, floor_number, room_type.as_str(), status.as_str()),
        )
        .map_err(db_err("db_insert_failed"))?;
        occupancy::reconcile_room(tx, &room_number).map_err(db_err("db_update_failed"))
    })?;

    Ok(json!({
        "roomId": id,
        "roomNumber": room_number,
        "status": reconciled.map(|r| r.status.as_str()).unwrap_or(status.as_str()),
    }))
}

fn rooms_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let room_number = get_required_str(params, "roomNumber")?;
    let patch = get_patch(params)?;
    if load_room(conn, &room_number)?.is_none() {
        return Err(HandlerErr::not_found("room"));
    }

    let mut sets: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    let mut new_number = room_number.clone();

    if let Some(v) = patch_str(patch, "roomNumber") {
        let Some(v) = v else {
            return Err(HandlerErr::bad_params("roomNumber must not be empty"));
        };
        sets.push("room_number = ?".into());
        binds.push(v.clone().into());
        new_number = v;
    }
    if let Some(v) = patch.get("capacity") {
        let cap = v
            .as_i64()
            .ok_or_else(|| HandlerErr::bad_params("capacity must be an integer"))?;
        sets.push("capacity = ?".into());
        binds.push(parse_capacity(cap)?.into());
    }
    if let Some(v) = patch.get("floorNumber") {
        let floor = match v {
            Value::Null => None,
            other => Some(
                other
                    .as_i64()
                    .ok_or_else(|| HandlerErr::bad_params("floorNumber must be an integer"))?,
            ),
        };
        sets.push("floor_number = ?".into());
        binds.push(floor.into());
    }
    if let Some(v) = patch.get("roomType") {
        let raw = v
            .as_str()
            .ok_or_else(|| HandlerErr::bad_params("roomType must be a string"))?;
        sets.push("room_type = ?".into());
        binds.push(parse_room_type(raw)?.as_str().to_string().into());
    }
    if let Some(v) = patch.get("status") {
        let raw = v
            .as_str()
            .ok_or_else(|| HandlerErr::bad_params("status must be a string"))?;
        sets.push("status = ?".into());
        binds.push(parse_requested_status(raw)?.as_str().to_string().into());
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("patch has no room fields"));
    }
    sets.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());
    binds.push(room_number.clone().into());

    let sql = format!("UPDATE rooms SET {} WHERE room_number = ?", sets.join(", "));
    let reconciled = in_tx(conn, |tx| {
        // Students follow the rename through ON UPDATE CASCADE.
        tx.execute(&sql, rusqlite::params_from_iter(binds.iter()))
            .map_err(db_err("db_update_failed"))?;
        occupancy::reconcile_room(tx, &new_number).map_err(db_err("db_update_failed"))
    })?;

    Ok(json!({
        "ok": true,
        "room": reconciled.map(|r| r.to_json()),
    }))
}

fn rooms_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let room_number = get_required_str(params, "roomNumber")?;
    let unassigned = in_tx(conn, |tx| {
        let count = occupancy::occupancy_of(tx, &room_number).map_err(db_err("db_query_failed"))?;
        let n = tx
            .execute("DELETE FROM rooms WHERE room_number = ?", [&room_number])
            .map_err(db_err("db_delete_failed"))?;
        if n == 0 {
            return Err(HandlerErr::not_found("room"));
        }
        Ok(count)
    })?;
    tracing::info!(room = %room_number, unassigned, "room deleted");
    Ok(json!({ "ok": true, "unassignedCount": unassigned }))
}

fn rooms_reconcile(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let room_number = get_required_str(params, "roomNumber")?;
    let r = in_tx(conn, |tx| {
        occupancy::reconcile_room(tx, &room_number).map_err(db_err("db_update_failed"))
    })?;
    match r {
        Some(r) => Ok(r.to_json()),
        None => Err(HandlerErr::not_found("room")),
    }
}

fn rooms_reconcile_all(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let all = in_tx(conn, |tx| {
        occupancy::reconcile_all(tx).map_err(db_err("db_update_failed"))
    })?;
    let changed = all.iter().filter(|r| r.changed).count();
    tracing::info!(rooms = all.len(), changed, "reconciled all rooms");
    Ok(json!({
        "rooms": all.iter().map(|r| r.to_json()).collect::<Vec<_>>(),
        "changed": changed,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "rooms.list" => Some(with_db(state, req, rooms_list)),
        "rooms.available" => Some(with_db(state, req, rooms_available)),
        "rooms.create" => Some(with_db(state, req, rooms_create)),
        "rooms.update" => Some(with_db(state, req, rooms_update)),
        "rooms.delete" => Some(with_db(state, req, rooms_delete)),
        "rooms.reconcile" => Some(with_db(state, req, rooms_reconcile)),
        "rooms.reconcileAll" => Some(with_db(state, req, rooms_reconcile_all)),
        _ => None,
    }
}
