use super::{Record, RecordValue};

/// Rolling list of scalar losses.
///
/// Losses are pushed once per epoch and reduced to mean and (population)
/// standard deviation at a logging cadence, after which the list is cleared.
#[derive(Debug, Clone, Default)]
pub struct LossStats {
    values: Vec<f32>,
}

impl LossStats {
    /// Appends a loss value.
    pub fn push(&mut self, v: f32) {
        self.values.push(v);
    }

    /// Number of accumulated values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if nothing was accumulated since the last clear.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Mean of the accumulated values, `NaN` when empty.
    pub fn mean(&self) -> f32 {
        if self.values.is_empty() {
            return f32::NAN;
        }
        self.values.iter().sum::<f32>() / self.values.len() as f32
    }

    /// Population standard deviation of the accumulated values, `NaN` when empty.
    pub fn std(&self) -> f32 {
        if self.values.is_empty() {
            return f32::NAN;
        }
        let m = self.mean();
        let var = self
            .values
            .iter()
            .map(|v| (v - m) * (v - m))
            .sum::<f32>()
            / self.values.len() as f32;
        var.sqrt()
    }

    /// Clears the accumulated values.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Returns `{prefix}_mean` and `{prefix}_std` as a [`Record`].
    pub fn to_record(&self, prefix: &str) -> Record {
        Record::from_slice(&[
            (format!("{}_mean", prefix), RecordValue::Scalar(self.mean())),
            (format!("{}_std", prefix), RecordValue::Scalar(self.std())),
        ])
    }

    /// Reduces the accumulated values to a [`Record`] and clears them.
    pub fn report(&mut self, prefix: &str) -> Record {
        let record = self.to_record(prefix);
        self.clear();
        record
    }
}
