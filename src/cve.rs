use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

/// Public NVD CVE registry, keyword-search endpoint.
pub const NVD_API_BASE: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";

const RESULTS_PER_PAGE: u32 = 10;
const MAX_REFERENCES: usize = 3;

#[derive(Debug, Error)]
pub enum CveError {
    #[error("Please enter a search term.")]
    EmptyQuery,
    #[error("Failed to fetch CVE data: {0}")]
    Network(String),
    #[error("CVE lookup failed with status {0}")]
    Api(u16),
    #[error("No CVEs found for this search")]
    NoResults,
}

/// One search hit, reduced to the fields the chat surface needs.
#[derive(Clone, Debug)]
pub struct CveRecord {
    pub id: String,
    pub description: String,
    pub severity: String,
    pub score: Option<f64>,
    pub published: String,
    pub references: Vec<String>,
}

impl CveRecord {
    pub fn score_display(&self) -> String {
        match self.score {
            Some(score) => score.to_string(),
            None => "N/A".to_string(),
        }
    }
}

// NVD 2.0 response shape, limited to what we read.

#[derive(Deserialize, Debug)]
struct NvdResponse {
    #[serde(default)]
    vulnerabilities: Vec<NvdVulnerability>,
}

#[derive(Deserialize, Debug)]
struct NvdVulnerability {
    cve: NvdCve,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct NvdCve {
    id: String,
    #[serde(default)]
    published: String,
    #[serde(default)]
    descriptions: Vec<NvdDescription>,
    #[serde(default)]
    metrics: NvdMetrics,
    #[serde(default)]
    references: Vec<NvdReference>,
}

#[derive(Deserialize, Debug)]
struct NvdDescription {
    lang: String,
    value: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct NvdMetrics {
    #[serde(default)]
    cvss_metric_v31: Vec<NvdMetric>,
    #[serde(default)]
    cvss_metric_v2: Vec<NvdMetric>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct NvdMetric {
    cvss_data: Option<NvdCvssData>,
    base_severity: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct NvdCvssData {
    base_score: Option<f64>,
    base_severity: Option<String>,
}

#[derive(Deserialize, Debug)]
struct NvdReference {
    url: String,
}

impl NvdCve {
    fn into_record(self) -> CveRecord {
        // Prefer CVSS v3.1, fall back to v2; severity may sit on the metric
        // itself (v2) or inside cvssData (v3.1).
        let NvdMetrics {
            cvss_metric_v31,
            cvss_metric_v2,
        } = self.metrics;
        let metric = cvss_metric_v31
            .into_iter()
            .next()
            .or_else(|| cvss_metric_v2.into_iter().next());

        let (severity, score) = match metric {
            Some(m) => {
                let severity = m
                    .cvss_data
                    .as_ref()
                    .and_then(|d| d.base_severity.clone())
                    .or(m.base_severity)
                    .unwrap_or_else(|| "UNKNOWN".to_string());
                let score = m.cvss_data.and_then(|d| d.base_score);
                (severity, score)
            }
            None => ("UNKNOWN".to_string(), None),
        };

        let description = self
            .descriptions
            .iter()
            .find(|d| d.lang == "en")
            .map(|d| d.value.clone())
            .unwrap_or_else(|| "No description available".to_string());

        CveRecord {
            id: self.id,
            description,
            severity,
            score,
            published: self.published,
            references: self
                .references
                .into_iter()
                .take(MAX_REFERENCES)
                .map(|r| r.url)
                .collect(),
        }
    }
}

/// Keyword-search client for the public CVE registry. Independent of the
/// completion pipeline; its only coupling to the chat core is the analysis
/// prompt used to seed a session.
pub struct CveClient {
    client: Client,
    base_url: String,
}

impl Default for CveClient {
    fn default() -> Self {
        Self::new(NVD_API_BASE)
    }
}

impl CveClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn search(&self, keyword: &str) -> Result<Vec<CveRecord>, CveError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(CveError::EmptyQuery);
        }

        log::info!("Searching CVE registry for '{}'", keyword);
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("keywordSearch", keyword),
                ("resultsPerPage", &RESULTS_PER_PAGE.to_string()),
            ])
            .send()
            .await
            .map_err(|e| CveError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CveError::Api(response.status().as_u16()));
        }

        let parsed: NvdResponse = response
            .json()
            .await
            .map_err(|e| CveError::Network(e.to_string()))?;

        if parsed.vulnerabilities.is_empty() {
            return Err(CveError::NoResults);
        }

        Ok(parsed
            .vulnerabilities
            .into_iter()
            .map(|v| v.cve.into_record())
            .collect())
    }
}

/// The canned prompt used to seed a chat session from a search hit.
pub fn analysis_prompt(record: &CveRecord) -> String {
    format!(
        "**CVE Analysis Request: {id}**\n\n\
         **Severity:** {severity} (Score: {score})\n\
         **Description:** {description}\n\n\
         Provide a concise analysis covering:\n\
         \u{2022} Exploitation techniques and attack vectors\n\
         \u{2022} Mitigation strategies and patches\n\
         \u{2022} Real-world impact and affected systems\n\
         \u{2022} Detection and prevention methods\n\n\
         Keep response structured and avoid excessive spacing.",
        id = record.id,
        severity = record.severity,
        score = record.score_display(),
        description = record.description,
    )
}
