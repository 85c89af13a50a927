//! Machine-readable installer output (the pip install-report JSON format).

use serde::Deserialize;

use super::InstallerError;

#[derive(Debug, Clone, Deserialize)]
pub struct InstallReport {
    pub version: String,
    #[serde(default)]
    pub install: Vec<InstallReportItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallReportItem {
    pub metadata: ReportMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportMetadata {
    pub name: String,
    pub version: String,
}

pub fn parse_install_report(raw: &str) -> Result<InstallReport, InstallerError> {
    serde_json::from_str(raw)
        .map_err(|err| InstallerError::Protocol(format!("install report did not parse: {err}")))
}
