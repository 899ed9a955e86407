use std::sync::Arc;

use futures::future::join_all;
use tokio::time::{Duration, Instant};

use crate::gateway::{FetchRequest, Gateway};

/// One cheap probe endpoint per source.
const PROBES: &[(&str, &str)] = &[
    (
        "pubmed",
        "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/einfo.fcgi?retmode=json",
    ),
    (
        "europepmc",
        "https://www.ebi.ac.uk/europepmc/webservices/rest/search?query=test&format=json&pageSize=1",
    ),
    ("openalex", "https://api.openalex.org/works?per-page=1"),
    (
        "semanticscholar",
        "https://api.semanticscholar.org/graph/v1/paper/search?query=test&limit=1",
    ),
    ("crossref", "https://api.crossref.org/works?rows=1"),
    ("core", "https://api.core.ac.uk/v3/search/works?q=test&limit=1"),
    ("biothings", "https://mygene.info/v3/metadata"),
    (
        "openi",
        "https://openi.nlm.nih.gov/api/search?query=test&m=1&n=1",
    ),
];

const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthRow {
    pub api: String,
    pub status: String,
    pub latency: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub healthy: usize,
    pub total: usize,
    pub rows: Vec<HealthRow>,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.healthy == self.total
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# litmcp health check\n\n");
        out.push_str("| API | Status | Latency |\n");
        out.push_str("|-----|--------|---------|\n");
        for row in &self.rows {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                row.api, row.status, row.latency
            ));
        }
        out.push_str(&format!(
            "\nStatus: {}/{} APIs healthy\n",
            self.healthy, self.total
        ));
        out
    }
}

pub async fn check(gateway: &Arc<Gateway>) -> HealthReport {
    let probes = PROBES.iter().map(|(api, url)| async move {
        let started = Instant::now();
        let outcome = gateway
            .fetch(FetchRequest::get(*url).deadline(Instant::now() + PROBE_TIMEOUT))
            .await;
        let latency = format!("{}ms", started.elapsed().as_millis());
        match outcome {
            Ok(_) => HealthRow {
                api: api.to_string(),
                status: "ok".into(),
                latency,
            },
            Err(err) => HealthRow {
                api: api.to_string(),
                status: format!("error ({})", err.kind.as_str()),
                latency,
            },
        }
    });

    let rows = join_all(probes).await;
    let healthy = rows.iter().filter(|r| r.status == "ok").count();
    HealthReport {
        healthy,
        total: rows.len(),
        rows,
    }
}
