//! Core types for smart-scale data.

use core::fmt;
use core::str::FromStr;
use std::collections::{BTreeSet, HashMap};

use bytes::Buf;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::Date;
use uuid::Uuid;

use crate::error::{ParseError, ParseResult};

#[cfg(feature = "serde")]
time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

/// Unit a scale reports its weight in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum WeightUnit {
    /// Kilograms.
    #[default]
    Kg,
    /// Pounds.
    Lb,
    /// Chinese jin (0.5 kg).
    Jin,
    /// Stones.
    St,
}

impl WeightUnit {
    /// Kilograms per one unit.
    #[must_use]
    pub fn kg_factor(self) -> f64 {
        match self {
            WeightUnit::Kg => 1.0,
            WeightUnit::Lb => 0.453_592_37,
            WeightUnit::Jin => 0.5,
            WeightUnit::St => 6.350_293_18,
        }
    }

    /// Convert a value expressed in this unit to kilograms.
    #[must_use]
    pub fn to_kg(self, value: f64) -> f64 {
        value * self.kg_factor()
    }

    /// Convert a value in kilograms to this unit.
    #[must_use]
    pub fn from_kg(self, kg: f64) -> f64 {
        kg / self.kg_factor()
    }
}

impl fmt::Display for WeightUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WeightUnit::Kg => "kg",
            WeightUnit::Lb => "lb",
            WeightUnit::Jin => "jin",
            WeightUnit::St => "st",
        };
        f.write_str(s)
    }
}

impl FromStr for WeightUnit {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "kg" | "kgs" => Ok(WeightUnit::Kg),
            "lb" | "lbs" => Ok(WeightUnit::Lb),
            "jin" => Ok(WeightUnit::Jin),
            "st" => Ok(WeightUnit::St),
            other => Err(ParseError::UnknownUnit(other.to_string())),
        }
    }
}

/// A single weight reading produced by a scale adapter.
///
/// `impedance` is `0` when the scale did not measure it. Weight is in
/// kilograms once the adapter (or the extraction layer) has normalized it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// Weight, kilograms after normalization.
    pub weight: f64,
    /// Bioelectrical impedance in ohms, `0` if absent.
    pub impedance: u32,
}

impl Reading {
    /// Create a reading with weight and impedance.
    #[must_use]
    pub fn new(weight: f64, impedance: u32) -> Self {
        Self { weight, impedance }
    }

    /// Create a weight-only reading.
    #[must_use]
    pub fn weight_only(weight: f64) -> Self {
        Self {
            weight,
            impedance: 0,
        }
    }

    /// Whether an impedance value was measured.
    #[must_use]
    pub fn has_impedance(&self) -> bool {
        self.impedance > 0
    }

    /// Return a copy with the weight converted from `unit` to kilograms.
    #[must_use]
    pub fn normalized_from(self, unit: WeightUnit) -> Self {
        Self {
            weight: unit.to_kg(self.weight),
            ..self
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_impedance() {
            write!(f, "{:.2} kg ({} Ω)", self.weight, self.impedance)
        } else {
            write!(f, "{:.2} kg", self.weight)
        }
    }
}

/// Manufacturer-specific advertisement payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ManufacturerData {
    /// Bluetooth SIG company identifier.
    pub company_id: u16,
    /// Payload bytes following the company identifier.
    pub data: Vec<u8>,
}

/// Everything a scale adapter may inspect to decide whether it recognizes
/// a device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    /// Advertised local name, if any.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub name: Option<String>,
    /// Advertised service UUIDs.
    #[cfg_attr(feature = "serde", serde(default))]
    pub services: BTreeSet<Uuid>,
    /// Manufacturer-specific data, if advertised.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub manufacturer: Option<ManufacturerData>,
    /// Service data keyed by service UUID.
    #[cfg_attr(feature = "serde", serde(default))]
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

impl DeviceInfo {
    /// Create an empty device description.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an advertised service.
    #[must_use]
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.services.insert(uuid);
        self
    }

    /// Set manufacturer data.
    #[must_use]
    pub fn with_manufacturer(mut self, company_id: u16, data: impl Into<Vec<u8>>) -> Self {
        self.manufacturer = Some(ManufacturerData {
            company_id,
            data: data.into(),
        });
        self
    }

    /// Add service data for a service UUID.
    #[must_use]
    pub fn with_service_data(mut self, uuid: Uuid, data: impl Into<Vec<u8>>) -> Self {
        self.service_data.insert(uuid, data.into());
        self
    }

    /// Whether `uuid` is advertised either as a service or as a service-data key.
    #[must_use]
    pub fn has_service(&self, uuid: &Uuid) -> bool {
        self.services.contains(uuid) || self.service_data.contains_key(uuid)
    }

    /// Case-insensitive check that the name starts with any of `prefixes`.
    #[must_use]
    pub fn name_starts_with(&self, prefixes: &[&str]) -> bool {
        let Some(name) = &self.name else {
            return false;
        };
        let lower = name.to_lowercase();
        prefixes.iter().any(|p| lower.starts_with(&p.to_lowercase()))
    }

    /// Service data advertised for `uuid`.
    #[must_use]
    pub fn service_data_for(&self, uuid: &Uuid) -> Option<&[u8]> {
        self.service_data.get(uuid).map(Vec::as_slice)
    }
}

/// Biological sex used by the body-composition formulas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Gender {
    /// Male.
    Male,
    /// Female.
    Female,
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gender::Male => f.write_str("male"),
            Gender::Female => f.write_str("female"),
        }
    }
}

/// A person who may step on the scale.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UserProfile {
    /// Display name.
    pub name: String,
    /// Stable identifier used in topics and target routing.
    pub slug: String,
    /// Height in centimeters.
    pub height: f64,
    /// Date of birth.
    #[cfg_attr(feature = "serde", serde(with = "iso_date"))]
    pub birth_date: Date,
    /// Biological sex.
    pub gender: Gender,
    /// Use the athlete variants of the formulas.
    #[cfg_attr(feature = "serde", serde(default))]
    pub athlete: bool,
    /// Lower bound of this user's expected weight, kilograms.
    pub min_weight: f64,
    /// Upper bound of this user's expected weight, kilograms.
    pub max_weight: f64,
    /// Most recent accepted weight, kilograms.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub last_known_weight: Option<f64>,
}

impl UserProfile {
    /// Age in whole years on `today`.
    #[must_use]
    pub fn age_on(&self, today: Date) -> u32 {
        let mut years = today.year() - self.birth_date.year();
        let before_birthday = (today.month() as u8, today.day())
            < (self.birth_date.month() as u8, self.birth_date.day());
        if before_birthday {
            years -= 1;
        }
        years.max(0) as u32
    }

    /// Age in whole years as of the current UTC date.
    #[must_use]
    pub fn age(&self) -> u32 {
        self.age_on(time::OffsetDateTime::now_utc().date())
    }

    /// Whether `weight` lies within `[min_weight, max_weight]`.
    #[must_use]
    pub fn in_range(&self, weight: f64) -> bool {
        weight >= self.min_weight && weight <= self.max_weight
    }

    /// Midpoint of the configured weight range.
    #[must_use]
    pub fn range_midpoint(&self) -> f64 {
        (self.min_weight + self.max_weight) / 2.0
    }
}

/// Derived body-composition metrics for one reading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BodyComposition {
    /// Weight, kilograms.
    pub weight: f64,
    /// Impedance in ohms, `0` when estimated without it.
    pub impedance: u32,
    /// Body-mass index.
    pub bmi: f64,
    /// Body fat percentage.
    pub body_fat_percent: f64,
    /// Lean body mass, kilograms.
    pub lean_mass: f64,
    /// Body water percentage.
    pub water_percent: f64,
    /// Skeletal muscle mass, kilograms.
    pub muscle_mass: f64,
    /// Bone mass, kilograms.
    pub bone_mass: f64,
    /// Visceral fat rating (1-59).
    pub visceral_fat: f64,
    /// Physique rating (1-9).
    pub physique_rating: u8,
    /// Basal metabolic rate, kcal/day.
    pub bmr: f64,
    /// Metabolic age, years.
    pub metabolic_age: u32,
    /// `true` when computed from weight, height, and age only.
    pub estimated: bool,
}

/// Bluetooth SIG Weight Measurement (0x2A9D) payload.
///
/// Only the flags byte and the weight field are decoded; optional trailing
/// fields (timestamp, user id, BMI, height) are ignored.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WeightMeasurement {
    /// Weight in the unit indicated by `unit`.
    pub weight: f64,
    /// `Kg` for SI resolution, `Lb` for imperial.
    pub unit: WeightUnit,
}

impl WeightMeasurement {
    /// Flag bit selecting imperial units.
    pub const FLAG_IMPERIAL: u8 = 0x01;

    /// Parse a Weight Measurement characteristic value.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InsufficientBytes`] if fewer than 3 bytes are given.
    pub fn from_bytes(data: &[u8]) -> ParseResult<Self> {
        if data.len() < 3 {
            return Err(ParseError::InsufficientBytes {
                expected: 3,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let flags = buf.get_u8();
        let raw = f64::from(buf.get_u16_le());

        let (weight, unit) = if flags & Self::FLAG_IMPERIAL != 0 {
            (raw / 100.0, WeightUnit::Lb)
        } else {
            (raw / 200.0, WeightUnit::Kg)
        };

        Ok(Self { weight, unit })
    }
}
