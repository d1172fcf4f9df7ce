//! File format discriminators

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Supported source formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,
    Excel,
    Json,
    Parquet,
}

impl FileFormat {
    /// Get all formats
    pub fn all() -> Vec<Self> {
        vec![Self::Csv, Self::Excel, Self::Json, Self::Parquet]
    }

    /// Get format name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Excel => "excel",
            Self::Json => "json",
            Self::Parquet => "parquet",
        }
    }

    /// Detect the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match extension.to_lowercase().as_str() {
            "csv" | "tsv" | "txt" => Some(Self::Csv),
            "xlsx" | "xlsm" => Some(Self::Excel),
            "json" | "jsonl" | "ndjson" => Some(Self::Json),
            "parquet" | "pq" => Some(Self::Parquet),
            _ => None,
        }
    }
}

impl std::fmt::Display for FileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for FileFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "excel" | "xlsx" => Ok(Self::Excel),
            "json" | "jsonl" => Ok(Self::Json),
            "parquet" => Ok(Self::Parquet),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_path() {
        assert_eq!(FileFormat::from_path(Path::new("a/LOT1.csv")), Some(FileFormat::Csv));
        assert_eq!(FileFormat::from_path(Path::new("b.XLSX")), Some(FileFormat::Excel));
        assert_eq!(FileFormat::from_path(Path::new("c.ndjson")), Some(FileFormat::Json));
        assert_eq!(FileFormat::from_path(Path::new("d.xml")), None);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("excel".parse::<FileFormat>().unwrap(), FileFormat::Excel);
        assert!("xml".parse::<FileFormat>().is_err());
    }
}
