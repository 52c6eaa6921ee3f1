use serde::{Deserialize, Serialize};

/// Average emissions of a passenger car per km travelled (EEA, 2018).
pub const CAR_G_PER_KM: f64 = 120.4;

/// An amount of CO2eq restated in a more familiar unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equivalent {
    pub value: f64,
    pub unit: String,
}

/// Restates `co2eq_g` grams in every known unit.
pub fn convert(co2eq_g: f64) -> Vec<Equivalent> {
    if !co2eq_g.is_finite() || co2eq_g < 0.0 {
        return Vec::new();
    }
    vec![Equivalent {
        value: co2eq_g / CAR_G_PER_KM,
        unit: "km travelled by car".to_string(),
    }]
}

/// Measured or predicted cost of a number of epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consumption {
    pub epochs: u32,
    pub duration_s: f64,
    pub energy_kwh: f64,
    pub co2eq_g: f64,
    pub intensity_g_per_kwh: f64,
    #[serde(default)]
    pub equivalents: Vec<Equivalent>,
}

impl Consumption {
    pub fn new(
        epochs: u32,
        duration_s: f64,
        energy_kwh: f64,
        intensity_g_per_kwh: f64,
        interpretable: bool,
    ) -> Self {
        let co2eq_g = energy_kwh * intensity_g_per_kwh;
        let equivalents = if interpretable { convert(co2eq_g) } else { Vec::new() };
        Self {
            epochs,
            duration_s,
            energy_kwh,
            co2eq_g,
            intensity_g_per_kwh,
            equivalents,
        }
    }
}
