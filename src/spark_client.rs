//! HTTP implementation of [`FleetApi`] against the Spark print REST API.
//!
//! Every request carries the account's bearer token. Non-success responses become a
//! [`RemoteError`] holding the status and the response body.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use crate::config::ApiConfig;
use crate::contract::{
    FleetApi, Job, JobCommand, Member, Printer, PrinterMember, PrinterStatus, PrinterType,
};
use crate::error::RemoteError;

#[derive(Deserialize)]
struct PrintersEnvelope {
    #[serde(default)]
    printers: Vec<Printer>,
}

#[derive(Deserialize)]
struct MembersEnvelope {
    #[serde(default)]
    members: Vec<PrinterMember>,
}

#[derive(Deserialize)]
struct JobsEnvelope {
    #[serde(default)]
    jobs: Vec<Job>,
}

pub struct SparkFleetClient {
    client: Client,
    base_url: String,
    access_token: Option<String>,
}

impl SparkFleetClient {
    pub fn new(config: &ApiConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            access_token: config.access_token.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        path: &str,
    ) -> Result<reqwest::Response, RemoteError> {
        let response = builder.send().await.map_err(|e| {
            error!(error = ?e, path, "Spark request failed");
            RemoteError::from(e)
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, path, "Spark API returned error. Response body: {body}");
            return Err(RemoteError::new(format!("{status}: {body}")));
        }
        debug!(status = %status, path, "Spark request succeeded");
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let response = self.send(self.request(Method::GET, path), path).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl FleetApi for SparkFleetClient {
    fn has_valid_token(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    async fn list_printers(&self) -> Result<Vec<Printer>, RemoteError> {
        let envelope: PrintersEnvelope = self.get_json("print/printers").await?;
        Ok(envelope.printers)
    }

    async fn printer_status(&self, printer_id: &str) -> Result<PrinterStatus, RemoteError> {
        self.get_json(&format!("print/printers/status/{printer_id}")).await
    }

    async fn register_printer(&self, name: &str, code: &str) -> Result<Printer, RemoteError> {
        let path = "print/printers/register";
        let builder = self
            .request(Method::POST, path)
            .json(&json!({ "printer_name": name, "registration_code": code }));
        Ok(self.send(builder, path).await?.json::<Printer>().await?)
    }

    async fn unregister_printer(&self, printer_id: &str) -> Result<(), RemoteError> {
        let path = format!("print/printers/{printer_id}");
        self.send(self.request(Method::DELETE, &path), &path).await?;
        Ok(())
    }

    async fn reset_printer(&self, printer_id: &str) -> Result<(), RemoteError> {
        let path = format!("print/printers/{printer_id}/reset");
        self.send(self.request(Method::POST, &path), &path).await?;
        Ok(())
    }

    async fn printer_type(&self, type_id: &str) -> Result<PrinterType, RemoteError> {
        self.get_json(&format!("print/printertypes/{type_id}")).await
    }

    async fn printer_members(&self, printer_id: &str) -> Result<Vec<PrinterMember>, RemoteError> {
        let envelope: MembersEnvelope = self
            .get_json(&format!("print/printers/{printer_id}/members"))
            .await?;
        Ok(envelope.members)
    }

    async fn member_profile(&self, member_id: &str) -> Result<Member, RemoteError> {
        self.get_json(&format!("members/{member_id}")).await
    }

    async fn job_status(&self, job_id: &str) -> Result<Job, RemoteError> {
        self.get_json(&format!("print/jobs/{job_id}")).await
    }

    async fn send_job_command(
        &self,
        printer_id: &str,
        job_id: &str,
        command: JobCommand,
    ) -> Result<(), RemoteError> {
        let path = format!("print/printers/{printer_id}/command");
        let builder = self
            .request(Method::POST, &path)
            .json(&json!({ "command": command.as_str(), "job_id": job_id }));
        self.send(builder, &path).await?;
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, RemoteError> {
        let envelope: JobsEnvelope = self.get_json("print/jobs").await?;
        Ok(envelope.jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str, token: Option<&str>) -> SparkFleetClient {
        SparkFleetClient::new(&ApiConfig {
            base_url: base_url.into(),
            access_token: token.map(str::to_owned),
        })
    }

    #[test]
    fn joins_paths_without_double_slashes() {
        let c = client("https://api.example.test/api/v1/", None);
        assert_eq!(
            c.url("/print/printers"),
            "https://api.example.test/api/v1/print/printers"
        );
    }

    #[test]
    fn token_must_be_present_and_non_empty() {
        assert!(!client("http://localhost", None).has_valid_token());
        assert!(!client("http://localhost", Some("")).has_valid_token());
        assert!(client("http://localhost", Some("abc")).has_valid_token());
    }

    #[test]
    fn printer_list_envelope_tolerates_missing_fields() {
        let envelope: PrintersEnvelope = serde_json::from_str(
            r#"{"printers":[{"printer_id":"p1","printer_name":"Ember","type_id":"t1"}]}"#,
        )
        .unwrap();
        assert_eq!(envelope.printers.len(), 1);
        assert!(envelope.printers[0].status.is_none());

        let empty: PrintersEnvelope = serde_json::from_str("{}").unwrap();
        assert!(empty.printers.is_empty());
    }
}
