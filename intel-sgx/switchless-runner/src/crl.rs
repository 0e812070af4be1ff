/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The contract this crate expects from a certificate revocation list
//! provider. Parsing and validating CRLs is left to the provider.

use std::fmt;

use thiserror::Error as ThisError;

/// A UTC timestamp with second precision. Orders chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Datetime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Datetime {
    /// Returns `None` if any field is out of range. Leap seconds are
    /// accepted.
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Option<Datetime> {
        if !(1..=12).contains(&month) || day == 0 || day > days_in_month(year, month) {
            return None;
        }
        if hour > 23 || minute > 59 || second > 60 {
            return None;
        }
        Some(Datetime { year, month, day, hour, minute, second })
    }
}

fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        4 | 6 | 9 | 11 => 30,
        2 if year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) => 29,
        2 => 28,
        _ => 31,
    }
}

impl fmt::Display for Datetime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// The thisUpdate and nextUpdate fields of a CRL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateDates {
    pub last: Datetime,
    pub next: Datetime,
}

#[derive(Debug, ThisError)]
pub enum CrlError {
    #[error("next update {next} precedes last update {last}")]
    Unordered { last: Datetime, next: Datetime },
    #[error("CRL provider failed: {0:#}")]
    Provider(anyhow::Error),
}

impl UpdateDates {
    pub fn check_ordered(self) -> Result<UpdateDates, CrlError> {
        if self.next < self.last {
            return Err(CrlError::Unordered {
                last: self.last,
                next: self.next,
            });
        }
        Ok(self)
    }
}

pub trait Crl {
    fn update_dates(&self) -> anyhow::Result<UpdateDates>;
}

/// Queries `crl` for its update dates and rejects dates that are out of
/// order.
pub fn verified_update_dates<C: Crl + ?Sized>(crl: &C) -> Result<UpdateDates, CrlError> {
    crl.update_dates().map_err(CrlError::Provider)?.check_ordered()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_validation() {
        assert!(Datetime::new(2024, 2, 29, 0, 0, 0).is_some());
        assert!(Datetime::new(2023, 2, 29, 0, 0, 0).is_none());
        assert!(Datetime::new(2100, 2, 29, 0, 0, 0).is_none());
        assert!(Datetime::new(2000, 2, 29, 0, 0, 0).is_some());
        assert!(Datetime::new(2024, 13, 1, 0, 0, 0).is_none());
        assert!(Datetime::new(2024, 4, 31, 0, 0, 0).is_none());
        assert!(Datetime::new(2024, 1, 1, 24, 0, 0).is_none());
    }

    #[test]
    fn ordering_and_display() {
        let a = Datetime::new(2024, 1, 31, 23, 59, 59).unwrap();
        let b = Datetime::new(2024, 2, 1, 0, 0, 0).unwrap();
        assert!(a < b);
        assert_eq!(b.to_string(), "2024-02-01T00:00:00Z");
        assert!(UpdateDates { last: a, next: b }.check_ordered().is_ok());
        assert!(UpdateDates { last: a, next: a }.check_ordered().is_ok());
        assert!(UpdateDates { last: b, next: a }.check_ordered().is_err());
    }
}
