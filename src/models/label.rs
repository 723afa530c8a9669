use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;

/// One detected object. Box coordinates are fractions of the image size.
///
/// Coordinates are fixed-point decimals serialized as strings, so a value
/// written to the record store reads back exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub class: String,
    pub cx: Decimal,
    pub cy: Decimal,
    pub width: Decimal,
    pub height: Decimal,
}

/// The 80 COCO categories the stock YOLOv5 weights are trained on.
const COCO_NAMES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Class-name table indexed by category id.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassNames(Vec<String>);

/// Dataset YAML as written by YOLOv5: `names` is either a list or an
/// index-to-name map.
#[derive(Deserialize)]
struct DatasetYaml {
    names: NamesField,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NamesField {
    List(Vec<String>),
    Map(BTreeMap<usize, String>),
}

impl ClassNames {
    pub fn new(names: Vec<String>) -> Self {
        Self(names)
    }

    pub fn coco() -> Self {
        Self(COCO_NAMES.iter().map(|name| name.to_string()).collect())
    }

    /// Parse the `names` entry of a dataset YAML file.
    pub fn from_yaml(contents: &str) -> Result<Self, LabelError> {
        let dataset: DatasetYaml =
            serde_yaml::from_str(contents).map_err(|e| LabelError::ClassTable(e.to_string()))?;

        match dataset.names {
            NamesField::List(names) => Ok(Self(names)),
            NamesField::Map(map) => {
                let mut names = Vec::with_capacity(map.len());
                for (expected, (index, name)) in map.into_iter().enumerate() {
                    if index != expected {
                        return Err(LabelError::ClassTable(format!(
                            "class ids must be contiguous from 0, missing id {expected}"
                        )));
                    }
                    names.push(name);
                }
                Ok(Self(names))
            }
        }
    }

    pub async fn load(path: &Path) -> Result<Self, LabelError> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&contents)
    }

    pub fn get(&self, id: usize) -> Option<&str> {
        self.0.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parse one detector output line: `<class id> <cx> <cy> <width> <height> [confidence]`.
pub fn parse_line(line: &str, line_no: usize, names: &ClassNames) -> Result<Label, LabelError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return Err(LabelError::FieldCount {
            line: line_no,
            found: fields.len(),
        });
    }

    let id: usize = fields[0].parse().map_err(|_| LabelError::ClassId {
        line: line_no,
        value: fields[0].to_string(),
    })?;
    let class = names.get(id).ok_or(LabelError::UnknownClass {
        line: line_no,
        id,
        known: names.len(),
    })?;

    let coord = |index: usize, field: &'static str| parse_fraction(fields[index], line_no, field);

    Ok(Label {
        class: class.to_string(),
        cx: coord(1, "cx")?,
        cy: coord(2, "cy")?,
        width: coord(3, "width")?,
        height: coord(4, "height")?,
    })
}

fn parse_fraction(value: &str, line: usize, field: &'static str) -> Result<Decimal, LabelError> {
    // `%g` formatting switches to exponent notation for very small values.
    let parsed = Decimal::from_str(value)
        .or_else(|_| Decimal::from_scientific(value))
        .map_err(|_| LabelError::Decimal {
            line,
            field,
            value: value.to_string(),
        })?;

    if parsed < Decimal::ZERO || parsed > Decimal::ONE {
        return Err(LabelError::OutOfRange {
            line,
            field,
            value: value.to_string(),
        });
    }
    Ok(parsed)
}

/// Parse the full contents of a labels file. Blank lines are ignored.
pub fn parse_labels(contents: &str, names: &ClassNames) -> Result<Vec<Label>, LabelError> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| parse_line(line, index + 1, names))
        .collect()
}

/// Read the labels file written by the detector. A missing file means the
/// detector found nothing.
pub async fn read_labels(path: &Path, names: &ClassNames) -> Result<Vec<Label>, LabelError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => parse_labels(&contents, names),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(LabelError::Io(e)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    #[error("line {line}: expected at least 5 fields, found {found}")]
    FieldCount { line: usize, found: usize },

    #[error("line {line}: class id {value:?} is not a non-negative integer")]
    ClassId { line: usize, value: String },

    #[error("line {line}: class id {id} out of range for {known} known classes")]
    UnknownClass { line: usize, id: usize, known: usize },

    #[error("line {line}: {field} value {value:?} is not a decimal")]
    Decimal {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("line {line}: {field} value {value} is outside [0, 1]")]
    OutOfRange {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("invalid class table: {0}")]
    ClassTable(String),

    #[error("cannot read detection output: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    #[test]
    fn test_parse_line_exact_decimals() {
        let names = ClassNames::coco();
        let label = parse_line("0 0.512000 0.498000 0.200000 0.330000", 1, &names).unwrap();

        assert_eq!(
            label,
            Label {
                class: "person".to_string(),
                cx: dec("0.512"),
                cy: dec("0.498"),
                width: dec("0.2"),
                height: dec("0.33"),
            }
        );
    }

    #[test]
    fn test_label_json_keeps_precision() {
        let names = ClassNames::coco();
        let label = parse_line("16 0.1 0.123456789012 0.3 0.4", 1, &names).unwrap();
        let json = serde_json::to_string(&label).unwrap();
        assert!(json.contains("\"0.123456789012\""));
        assert!(json.contains("\"class\":\"dog\""));

        let back: Label = serde_json::from_str(&json).unwrap();
        assert_eq!(back, label);
    }

    #[test]
    fn test_class_id_out_of_range() {
        let names = ClassNames::new(vec!["person".to_string()]);
        let err = parse_line("3 0.5 0.5 0.1 0.1", 7, &names).unwrap_err();
        assert!(matches!(err, LabelError::UnknownClass { line: 7, id: 3, known: 1 }));
    }

    #[test]
    fn test_bad_fields() {
        let names = ClassNames::coco();
        assert!(matches!(
            parse_line("0 0.5 0.5 0.1", 1, &names),
            Err(LabelError::FieldCount { found: 4, .. })
        ));
        assert!(matches!(
            parse_line("-1 0.5 0.5 0.1 0.1", 1, &names),
            Err(LabelError::ClassId { .. })
        ));
        assert!(matches!(
            parse_line("0 0.5 abc 0.1 0.1", 1, &names),
            Err(LabelError::Decimal { field: "cy", .. })
        ));
        assert!(matches!(
            parse_line("0 0.5 0.5 1.5 0.1", 1, &names),
            Err(LabelError::OutOfRange { field: "width", .. })
        ));
    }

    #[test]
    fn test_confidence_column_and_exponent_notation() {
        let names = ClassNames::coco();
        let label = parse_line("2 0.5 0.5 1e-05 0.25 0.87", 1, &names).unwrap();
        assert_eq!(label.class, "car");
        assert_eq!(label.width, dec("0.00001"));
    }

    #[test]
    fn test_parse_labels_skips_blank_lines() {
        let names = ClassNames::coco();
        let labels = parse_labels("0 0.1 0.1 0.1 0.1\n\n2 0.2 0.2 0.2 0.2\n", &names).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[1].class, "car");

        assert!(parse_labels("", &names).unwrap().is_empty());
    }

    #[test]
    fn test_parse_labels_reports_line_number() {
        let names = ClassNames::coco();
        let err = parse_labels("0 0.1 0.1 0.1 0.1\n99 0.1 0.1 0.1 0.1\n", &names).unwrap_err();
        assert!(matches!(err, LabelError::UnknownClass { line: 2, id: 99, .. }));
    }

    #[tokio::test]
    async fn test_missing_labels_file_means_no_detections() {
        let dir = tempfile::tempdir().unwrap();
        let labels = read_labels(&dir.path().join("absent.txt"), &ClassNames::coco())
            .await
            .unwrap();
        assert!(labels.is_empty());
    }

    #[test]
    fn test_class_names_from_yaml() {
        let list = ClassNames::from_yaml("path: ../datasets\nnames: [person, bicycle]\n").unwrap();
        assert_eq!(list.get(1), Some("bicycle"));

        let map = ClassNames::from_yaml("names:\n  0: person\n  1: bicycle\n  2: car\n").unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(2), Some("car"));

        assert!(ClassNames::from_yaml("names:\n  0: person\n  2: car\n").is_err());
    }

    #[test]
    fn test_coco_table() {
        let names = ClassNames::coco();
        assert_eq!(names.len(), 80);
        assert_eq!(names.get(0), Some("person"));
        assert_eq!(names.get(79), Some("toothbrush"));
        assert_eq!(names.get(80), None);
    }
}
