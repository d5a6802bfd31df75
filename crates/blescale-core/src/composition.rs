//! Body-composition estimates from weight, impedance, and a user profile.
//!
//! With impedance, lean body mass comes from a BIA regression on
//! height²/impedance. Without it, body fat falls back to the Deurenberg
//! BMI formula. Both paths never fail for positive weight and height.

use blescale_types::{BodyComposition, Gender, Reading, UserProfile};

/// Regression constants `(c1, c2, c3, c4)` for `LBM = c1·h²/R + c2·W + c3·age + c4`.
fn bia_constants(gender: Gender, athlete: bool) -> (f64, f64, f64, f64) {
    match (gender, athlete) {
        (Gender::Male, false) => (0.503, 0.165, -0.158, 17.8),
        (Gender::Male, true) => (0.637, 0.205, -0.180, 12.5),
        (Gender::Female, false) => (0.490, 0.150, -0.130, 11.5),
        (Gender::Female, true) => (0.550, 0.180, -0.150, 8.5),
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Compute body composition for `reading` as measured by `profile` at `age`.
pub fn compute(reading: &Reading, profile: &UserProfile, age: u32) -> BodyComposition {
    let weight = reading.weight;
    let height = profile.height;
    let age_f = f64::from(age);
    let athlete = profile.athlete;
    let height_m = height / 100.0;
    let bmi = if height_m > 0.0 {
        weight / (height_m * height_m)
    } else {
        0.0
    };

    let estimated = !reading.has_impedance() || weight <= 0.0 || height <= 0.0;

    let (body_fat_percent, lean_mass) = if estimated {
        let sex = if profile.gender == Gender::Male { 1.0 } else { 0.0 };
        let fat = (1.2 * bmi + 0.23 * age_f - 10.8 * sex - 5.4).clamp(5.0, 40.0);
        (fat, weight * (1.0 - fat / 100.0))
    } else {
        let (c1, c2, c3, c4) = bia_constants(profile.gender, athlete);
        let h2_r = height * height / f64::from(reading.impedance);
        let mut lbm = c1 * h2_r + c2 * weight + c3 * age_f + c4;
        if lbm > weight {
            lbm = weight * 0.96;
        }
        let fat = ((weight - lbm) / weight * 100.0).clamp(3.0, 60.0);
        (fat, lbm)
    };

    let water_coefficient = if athlete { 0.74 } else { 0.73 };
    let water_percent = if weight > 0.0 {
        lean_mass * water_coefficient / weight * 100.0
    } else {
        0.0
    };
    let bone_mass = lean_mass * 0.042;
    let muscle_mass = lean_mass - bone_mass;

    let offset = if profile.gender == Gender::Male { 5.0 } else { -161.0 };
    let mut bmr = 10.0 * weight + 6.25 * height - 5.0 * age_f + offset;
    if athlete {
        bmr *= 1.05;
    }
    let ideal_bmr = 10.0 * weight + 6.25 * height - 5.0 * 25.0 + 5.0;
    let mut metabolic_age = (age_f + ((ideal_bmr - bmr) / 15.0).trunc()).max(12.0) as u32;
    if athlete && metabolic_age > age {
        metabolic_age = age.saturating_sub(2);
    }

    BodyComposition {
        weight: round2(weight),
        impedance: reading.impedance,
        bmi: round2(bmi),
        body_fat_percent: round2(body_fat_percent),
        lean_mass: round2(lean_mass),
        water_percent: round2(water_percent),
        muscle_mass: round2(muscle_mass),
        bone_mass: round2(bone_mass),
        visceral_fat: visceral_fat(bmi, age_f, profile.gender),
        physique_rating: physique_rating(body_fat_percent, muscle_mass, weight, profile.gender),
        bmr: bmr.trunc(),
        metabolic_age,
        estimated,
    }
}

fn visceral_fat(bmi: f64, age: f64, gender: Gender) -> f64 {
    let offset = if gender == Gender::Male { 0.0 } else { -2.5 };
    (0.35 * bmi + 0.07 * age + offset - 6.0).clamp(1.0, 59.0).round()
}

/// Tanita-style 1-9 grid of fat band (high/normal/low) by muscle band.
fn physique_rating(fat_percent: f64, muscle_mass: f64, weight: f64, gender: Gender) -> u8 {
    let (fat_low, fat_high, muscle_low, muscle_high) = match gender {
        Gender::Male => (10.0, 20.0, 0.70, 0.80),
        Gender::Female => (20.0, 30.0, 0.62, 0.72),
    };
    let muscle_ratio = if weight > 0.0 {
        muscle_mass / weight
    } else {
        0.0
    };

    let fat_row: u8 = if fat_percent > fat_high {
        0
    } else if fat_percent >= fat_low {
        1
    } else {
        2
    };
    let muscle_col: u8 = if muscle_ratio < muscle_low {
        1
    } else if muscle_ratio <= muscle_high {
        2
    } else {
        3
    };
    fat_row * 3 + muscle_col
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn profile(gender: Gender, athlete: bool) -> UserProfile {
        UserProfile {
            name: "Dad".into(),
            slug: "dad".into(),
            height: 180.0,
            birth_date: date!(1985 - 01 - 01),
            gender,
            athlete,
            min_weight: 75.0,
            max_weight: 95.0,
            last_known_weight: None,
        }
    }

    #[test]
    fn test_bia_male() {
        let c = compute(&Reading::new(80.0, 500), &profile(Gender::Male, false), 40);
        // LBM = 0.503*64.8 + 0.165*80 - 0.158*40 + 17.8 = 57.2744
        assert!((c.lean_mass - 57.27).abs() < 0.01);
        assert!((c.body_fat_percent - 28.41).abs() < 0.01);
        assert!((c.bmi - 24.69).abs() < 0.01);
        assert!((c.bone_mass - 2.41).abs() < 0.01);
        // 800 + 1125 - 200 + 5
        assert_eq!(c.bmr, 1730.0);
        assert!(!c.estimated);
    }

    #[test]
    fn test_lbm_capped_below_weight() {
        let c = compute(&Reading::new(40.0, 50), &profile(Gender::Male, true), 30);
        assert!((c.lean_mass - 38.4).abs() < 0.01);
        assert!((c.body_fat_percent - 4.0).abs() < 0.01);
    }

    #[test]
    fn test_fallback_without_impedance() {
        let c = compute(&Reading::weight_only(80.0), &profile(Gender::Male, false), 40);
        assert!(c.estimated);
        assert!((5.0..=40.0).contains(&c.body_fat_percent));
        assert_eq!(c.impedance, 0);
    }

    #[test]
    fn test_fallback_is_clamped() {
        let mut p = profile(Gender::Female, false);
        p.height = 150.0;
        let c = compute(&Reading::weight_only(200.0), &p, 80);
        assert_eq!(c.body_fat_percent, 40.0);

        let c = compute(&Reading::weight_only(35.0), &profile(Gender::Male, false), 18);
        assert_eq!(c.body_fat_percent, 5.0);
    }

    #[test]
    fn test_metabolic_age_floor_and_athlete_cap() {
        let c = compute(&Reading::new(80.0, 500), &profile(Gender::Male, false), 5);
        assert_eq!(c.metabolic_age, 12);

        let c = compute(&Reading::new(60.0, 500), &profile(Gender::Female, true), 40);
        assert!(c.metabolic_age <= 40);
    }

    #[test]
    fn test_ratings_in_range() {
        for imp in [0, 350, 500, 800] {
            for gender in [Gender::Male, Gender::Female] {
                let c = compute(&Reading::new(72.0, imp), &profile(gender, false), 35);
                assert!((1.0..=59.0).contains(&c.visceral_fat));
                assert!((1..=9).contains(&c.physique_rating));
            }
        }
    }
}
