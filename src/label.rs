use serde::Serialize;
use std::fmt;

/// Class index order follows the alphabetical folder order of the training
/// set: NORMAL = 0, PNEUMONIA = 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClassLabel {
    Normal = 0,
    Pneumonia = 1,
}

impl ClassLabel {
    pub const ALL: [ClassLabel; 2] = [ClassLabel::Normal, ClassLabel::Pneumonia];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClassLabel::Normal => "NORMAL",
            ClassLabel::Pneumonia => "PNEUMONIA",
        }
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index of the largest score. Only a strictly greater score replaces the
/// current best, so exact ties go to the lower index (NORMAL). Comparisons
/// with NaN are false: a NaN after index 0 is never picked and a NaN at index
/// 0 keeps NORMAL. Returns 0 for an empty slice.
pub fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (i, &score) in scores.iter().enumerate().skip(1) {
        if score > scores[best] {
            best = i;
        }
    }
    best
}

pub fn softmax(data: &[f32]) -> Vec<f32> {
    let max_val = data.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exps: Vec<f32> = data.iter().map(|&x| (x - max_val).exp()).collect();
    let sum_exps: f32 = exps.iter().sum();
    exps.into_iter().map(|x| x / sum_exps).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_table_is_alphabetical() {
        assert_eq!(ClassLabel::from_index(0), Some(ClassLabel::Normal));
        assert_eq!(ClassLabel::from_index(1), Some(ClassLabel::Pneumonia));
        assert_eq!(ClassLabel::from_index(2), None);
        assert_eq!(ClassLabel::Pneumonia.index(), 1);
        assert_eq!(ClassLabel::Normal.to_string(), "NORMAL");
        assert_eq!(ClassLabel::Pneumonia.to_string(), "PNEUMONIA");
    }

    #[test]
    fn tie_resolves_to_normal() {
        assert_eq!(argmax(&[0.5, 0.5]), 0);
        assert_eq!(argmax(&[-3.0, -3.0]), 0);
    }

    #[test]
    fn argmax_picks_largest() {
        assert_eq!(argmax(&[0.1, 0.9]), 1);
        assert_eq!(argmax(&[2.0, -1.0]), 0);
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn nan_scores_fall_back_to_normal() {
        assert_eq!(argmax(&[0.2, f32::NAN]), 0);
        assert_eq!(argmax(&[f32::NAN, 0.2]), 0);
    }

    #[test]
    fn softmax_sums_to_one_and_preserves_order() {
        let probs = softmax(&[1.0, 3.0]);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(probs[1] > probs[0]);

        let even = softmax(&[1000.0, 1000.0]);
        assert!((even[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn serializes_as_upper_case_name() {
        assert_eq!(
            serde_json::to_string(&ClassLabel::Pneumonia).unwrap(),
            "\"PNEUMONIA\""
        );
    }
}
