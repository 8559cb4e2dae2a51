//! Admission rules for the three guest transitions.
//!
//! Each `plan_*` function reads a locked [`TableState`], decides whether the
//! transition is admissible and returns the counters the table will hold
//! afterwards. Nothing here mutates state; the caller persists and applies.

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput("guest name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::InvalidInput("guest name too long"));
    }
    Ok(())
}

pub(crate) fn validate_accompanying(accompanying_guests: u32) -> Result<(), EngineError> {
    if accompanying_guests > MAX_ACCOMPANYING_GUESTS {
        return Err(EngineError::InvalidInput("too many accompanying guests"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationPlan {
    pub party_size: u32,
    pub num_reserved: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalPlan {
    pub accompanying_guests: u32,
    pub num_arrived: u32,
    pub num_reserved: u32,
    pub num_occupied: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeparturePlan {
    pub freed: u32,
    pub num_occupied: u32,
}

fn capacity_exceeded(table: &TableState, requested: u64) -> EngineError {
    EngineError::CapacityExceeded {
        table_id: table.id,
        capacity: table.capacity,
        requested,
    }
}

/// Reserve: the whole party must fit in the table's remaining reservations.
pub fn plan_reservation(
    table: &TableState,
    name: &str,
    accompanying_guests: u32,
) -> Result<ReservationPlan, EngineError> {
    if table.guests.contains_key(name) {
        return Err(EngineError::AlreadyReserved(name.to_string()));
    }
    let party_size = accompanying_guests + 1;
    let projected = u64::from(table.num_reserved) + u64::from(party_size);
    if projected > u64::from(table.capacity) {
        return Err(capacity_exceeded(table, projected));
    }
    Ok(ReservationPlan {
        party_size,
        num_reserved: projected as u32,
    })
}

/// Arrive: only the change in entourage relative to the reservation is
/// charged against the reservation count. The occupied count grows by the
/// full arriving party and is bounded by the reservation count, since the
/// arriving party is itself part of it.
pub fn plan_arrival(
    table: &TableState,
    name: &str,
    accompanying_guests: u32,
) -> Result<ArrivalPlan, EngineError> {
    let guest = table
        .guests
        .get(name)
        .ok_or_else(|| EngineError::NoReservation(name.to_string()))?;
    if guest.is_arrived() {
        return Err(EngineError::AlreadyArrived(name.to_string()));
    }

    let party_size = accompanying_guests + 1;
    let delta_reserved = i64::from(accompanying_guests) - i64::from(guest.accompanying_guests);
    let projected_reserved = i64::from(table.num_reserved) + delta_reserved;
    if projected_reserved > i64::from(table.capacity) {
        return Err(capacity_exceeded(table, projected_reserved as u64));
    }
    // The guest's own reserved party is part of num_reserved.
    let projected_reserved = projected_reserved.max(0) as u32;
    let projected_occupied = table.num_occupied + party_size;
    debug_assert!(
        projected_occupied <= projected_reserved,
        "occupied {projected_occupied} exceeds reserved {projected_reserved} on table {}",
        table.id
    );

    Ok(ArrivalPlan {
        accompanying_guests,
        num_arrived: party_size,
        num_reserved: projected_reserved,
        num_occupied: projected_occupied,
    })
}

/// Depart: frees exactly the seats the party occupied. Reservations stay.
pub fn plan_departure(table: &TableState, name: &str) -> Result<DeparturePlan, EngineError> {
    let guest = table
        .guests
        .get(name)
        .ok_or_else(|| EngineError::NoReservation(name.to_string()))?;
    if !guest.is_arrived() {
        return Err(EngineError::NotArrived(name.to_string()));
    }
    debug_assert!(guest.num_arrived <= table.num_occupied);
    Ok(DeparturePlan {
        freed: guest.num_arrived,
        num_occupied: table.num_occupied.saturating_sub(guest.num_arrived),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(capacity: u32) -> TableState {
        TableState::new(1, capacity)
    }

    fn with_guest(mut ts: TableState, name: &str, accompanying: u32, arrived: bool) -> TableState {
        let mut g = GuestRecord::new(name.into(), ts.id, accompanying);
        ts.num_reserved += g.party_size();
        if arrived {
            g.num_arrived = g.party_size();
            g.time_arrived = Some(1);
            ts.num_occupied += g.num_arrived;
        }
        ts.guests.insert(name.into(), g);
        ts
    }

    #[test]
    fn reservation_fills_table_exactly() {
        let plan = plan_reservation(&table(5), "john", 4).unwrap();
        assert_eq!(plan, ReservationPlan { party_size: 5, num_reserved: 5 });
    }

    #[test]
    fn reservation_over_capacity_rejected() {
        let ts = with_guest(table(5), "john", 4, false);
        let err = plan_reservation(&ts, "mike", 0).unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded { table_id: 1, capacity: 5, requested: 6 }
        ));
    }

    #[test]
    fn reservation_same_name_rejected() {
        let ts = with_guest(table(10), "john", 0, false);
        assert!(matches!(
            plan_reservation(&ts, "john", 0),
            Err(EngineError::AlreadyReserved(_))
        ));
    }

    #[test]
    fn arrival_with_larger_entourage_charges_delta() {
        // reserved party of 3, arrives as 5, capacity 6
        let ts = with_guest(table(6), "john", 2, false);
        assert_eq!(ts.num_reserved, 3);
        let plan = plan_arrival(&ts, "john", 4).unwrap();
        assert_eq!(plan.num_reserved, 5);
        assert_eq!(plan.num_occupied, 5);
        assert_eq!(plan.num_arrived, 5);
        assert_eq!(plan.accompanying_guests, 4);
    }

    #[test]
    fn arrival_with_smaller_entourage_releases_reservations() {
        let ts = with_guest(table(6), "john", 3, false);
        let plan = plan_arrival(&ts, "john", 1).unwrap();
        assert_eq!(plan.num_reserved, 2);
        assert_eq!(plan.num_occupied, 2);
    }

    #[test]
    fn arrival_delta_over_capacity_rejected() {
        let ts = with_guest(with_guest(table(6), "anna", 2, false), "john", 1, false);
        assert_eq!(ts.num_reserved, 5);
        let err = plan_arrival(&ts, "john", 3).unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded { requested: 7, .. }));
    }

    #[test]
    fn arrival_without_reservation_rejected() {
        assert!(matches!(
            plan_arrival(&table(4), "ghost", 0),
            Err(EngineError::NoReservation(_))
        ));
    }

    #[test]
    fn arrival_twice_rejected() {
        let ts = with_guest(table(4), "john", 1, true);
        assert!(matches!(
            plan_arrival(&ts, "john", 1),
            Err(EngineError::AlreadyArrived(_))
        ));
    }

    #[test]
    fn departure_frees_party() {
        let ts = with_guest(with_guest(table(8), "anna", 1, true), "john", 2, true);
        assert_eq!(ts.num_occupied, 5);
        let plan = plan_departure(&ts, "john").unwrap();
        assert_eq!(plan, DeparturePlan { freed: 3, num_occupied: 2 });
    }

    #[test]
    fn departure_before_arrival_rejected() {
        let ts = with_guest(table(4), "john", 0, false);
        assert!(matches!(
            plan_departure(&ts, "john"),
            Err(EngineError::NotArrived(_))
        ));
    }

    #[test]
    fn departure_without_reservation_rejected() {
        assert!(matches!(
            plan_departure(&table(4), "ghost"),
            Err(EngineError::NoReservation(_))
        ));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("john").is_ok());
        assert!(matches!(validate_name("   "), Err(EngineError::InvalidInput(_))));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(validate_name(&long), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn accompanying_validation() {
        assert!(validate_accompanying(0).is_ok());
        assert!(validate_accompanying(MAX_ACCOMPANYING_GUESTS).is_ok());
        assert!(validate_accompanying(MAX_ACCOMPANYING_GUESTS + 1).is_err());
    }
}
