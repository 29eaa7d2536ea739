use std::f32::consts::PI;

pub const CURVE_LEN: usize = 256;

const DEG_20: f32 = 20.0 * PI / 180.0;

/// Waveshaper transfer table. A pure function of `amount`, so it is rebuilt
/// whole whenever the amount changes rather than patched in place.
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionCurve {
    table: Vec<f32>,
    amount: f32,
}

impl DistortionCurve {
    pub fn build(amount: f32) -> Self {
        let amount = amount.max(0.0);
        let table = (0..CURVE_LEN)
            .map(|i| {
                let x = 2.0 * i as f32 / (CURVE_LEN - 1) as f32 - 1.0;
                (3.0 + amount) * x * DEG_20 / (PI + amount * x.abs())
            })
            .collect();
        DistortionCurve { table, amount }
    }

    pub fn amount(&self) -> f32 {
        self.amount
    }

    pub fn table(&self) -> &[f32] {
        &self.table
    }

    /// Apply the curve to one sample, interpolating between table entries.
    pub fn shape(&self, input: f32) -> f32 {
        let x = input.clamp(-1.0, 1.0);
        let pos = (x + 1.0) * 0.5 * (CURVE_LEN - 1) as f32;
        let index = pos as usize;
        if index + 1 >= CURVE_LEN {
            return self.table[CURVE_LEN - 1];
        }
        let frac = pos - index as f32;
        self.table[index] * (1.0 - frac) + self.table[index + 1] * frac
    }
}
