use ndarray::Array1;

use super::ClassifierError;

/// Fixed bijection between category labels and one-hot vectors.
/// Classes are sorted so the encoding does not depend on discovery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryEncoder {
    classes: Vec<String>,
}

impl CategoryEncoder {
    pub fn fit<I, S>(labels: I) -> Result<Self, ClassifierError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut classes: Vec<String> = labels.into_iter().map(|s| s.as_ref().to_string()).collect();
        classes.sort();
        classes.dedup();
        if classes.is_empty() {
            return Err(ClassifierError::NoCategories);
        }
        Ok(Self { classes })
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.classes.binary_search_by(|c| c.as_str().cmp(label)).ok()
    }

    pub fn encode(&self, label: &str) -> Result<Array1<f32>, ClassifierError> {
        let idx = self
            .index_of(label)
            .ok_or_else(|| ClassifierError::UnknownCategory(label.to_string()))?;
        Ok(self.one_hot(idx))
    }

    pub fn one_hot(&self, idx: usize) -> Array1<f32> {
        let mut v = Array1::zeros(self.classes.len());
        if idx < v.len() {
            v[idx] = 1.0;
        }
        v
    }

    pub fn decode(&self, idx: usize) -> Option<&str> {
        self.classes.get(idx).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_fit_sorts_and_dedups() {
        let enc = CategoryEncoder::fit(["rock", "jazz", "rock", "ambient"]).unwrap();
        assert_eq!(enc.classes(), &["ambient", "jazz", "rock"]);
        assert_eq!(enc.len(), 3);
    }

    #[test]
    fn test_encode_decode_bijection() {
        let enc = CategoryEncoder::fit(["rock", "jazz"]).unwrap();
        assert_eq!(enc.encode("jazz").unwrap(), array![1.0, 0.0]);
        assert_eq!(enc.encode("rock").unwrap(), array![0.0, 1.0]);
        for (i, class) in enc.classes().iter().enumerate() {
            assert_eq!(enc.decode(i), Some(class.as_str()));
            assert_eq!(enc.index_of(class), Some(i));
        }
        assert_eq!(enc.decode(2), None);
    }

    #[test]
    fn test_unknown_category() {
        let enc = CategoryEncoder::fit(["rock"]).unwrap();
        assert!(matches!(enc.encode("polka"), Err(ClassifierError::UnknownCategory(_))));
    }

    #[test]
    fn test_empty_fit_fails() {
        let labels: Vec<String> = Vec::new();
        assert!(matches!(CategoryEncoder::fit(labels), Err(ClassifierError::NoCategories)));
    }
}
