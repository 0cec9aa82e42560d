use rusqlite::{Connection, OptionalExtension};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Available,
    Full,
    Occupied,
    Maintenance,
    Blocked,
}

impl RoomStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "available" => Some(Self::Available),
            "full" => Some(Self::Full),
            "occupied" => Some(Self::Occupied),
            "maintenance" => Some(Self::Maintenance),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Full => "full",
            Self::Occupied => "occupied",
            Self::Maintenance => "maintenance",
            Self::Blocked => "blocked",
        }
    }

    /// Statuses set by an administrator that occupancy never overrides.
    pub fn is_manual_hold(self) -> bool {
        matches!(self, Self::Maintenance | Self::Blocked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomType {
    Standard,
    Deluxe,
    Premium,
}

impl RoomType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Some(Self::Standard),
            "deluxe" => Some(Self::Deluxe),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Deluxe => "deluxe",
            Self::Premium => "premium",
        }
    }
}

/// Status a room should carry given its occupancy. Manual holds win.
pub fn derive_room_status(occupancy: i64, capacity: i64, current: RoomStatus) -> RoomStatus {
    if current.is_manual_hold() {
        return current;
    }
    if occupancy >= capacity {
        RoomStatus::Full
    } else {
        RoomStatus::Available
    }
}

pub fn free_slots(occupancy: i64, capacity: i64) -> i64 {
    (capacity - occupancy).max(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub room_number: String,
    pub occupancy: i64,
    pub capacity: i64,
    pub status: RoomStatus,
    pub changed: bool,
}

impl Reconciled {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "roomNumber": self.room_number,
            "occupancy": self.occupancy,
            "capacity": self.capacity,
            "status": self.status.as_str(),
            "changed": self.changed,
            "overCapacity": self.occupancy > self.capacity,
        })
    }
}

pub fn occupancy_of(conn: &Connection, room_number: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM students WHERE room_number = ?",
        [room_number],
        |r| r.get(0),
    )
}

/// Recompute and store the derived status of one room.
///
/// Callers run this inside the transaction of the mutation that changed
/// occupancy or capacity, so the stored status matches at commit. Returns
/// `None` when no room carries `room_number`.
pub fn reconcile_room(conn: &Connection, room_number: &str) -> rusqlite::Result<Option<Reconciled>> {
    let room: Option<(i64, String)> = conn
        .query_row(
            "SELECT capacity, status FROM rooms WHERE room_number = ?",
            [room_number],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((capacity, stored)) = room else {
        return Ok(None);
    };

    let occupancy = occupancy_of(conn, room_number)?;
    let current = RoomStatus::parse(&stored).unwrap_or(RoomStatus::Available);
    let status = derive_room_status(occupancy, capacity, current);
    let changed = status.as_str() != stored;
    if changed {
        conn.execute(
            "UPDATE rooms
             SET status = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE room_number = ?",
            (status.as_str(), room_number),
        )?;
    }
    tracing::debug!(
        room = room_number,
        occupancy,
        capacity,
        status = status.as_str(),
        changed,
        "reconciled room"
    );

    Ok(Some(Reconciled {
        room_number: room_number.to_string(),
        occupancy,
        capacity,
        status,
        changed,
    }))
}

/// Reconcile each distinct room once, skipping empty keys.
pub fn reconcile_rooms<'a, I>(conn: &Connection, rooms: I) -> rusqlite::Result<Vec<Reconciled>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen: Vec<&str> = Vec::new();
    let mut out = Vec::new();
    for rn in rooms {
        if rn.is_empty() || seen.contains(&rn) {
            continue;
        }
        seen.push(rn);
        if let Some(r) = reconcile_room(conn, rn)? {
            out.push(r);
        }
    }
    Ok(out)
}

pub fn reconcile_all(conn: &Connection) -> rusqlite::Result<Vec<Reconciled>> {
    let room_numbers = {
        let mut stmt = conn.prepare("SELECT room_number FROM rooms ORDER BY room_number")?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    reconcile_rooms(conn, room_numbers.iter().map(|s| s.as_str()))
}
