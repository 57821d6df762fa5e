//! REST implementations of the cloud capabilities against Google's JSON APIs.

use super::auth::TokenSource;
use super::{
    CloudError, CloudResult, CsvExportRequest, CsvImportRequest, InstanceDetails, ObjectStorage,
    SqlAdmin, Warehouse, WarehouseField, WarehouseLoadRequest,
};
use async_trait::async_trait;
use reqwest::{Method, Url};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info};

const SQL_ADMIN_BASE: &str = "https://sqladmin.googleapis.com/sql/v1beta4/";
const STORAGE_BASE: &str = "https://storage.googleapis.com/storage/v1/";
const BIGQUERY_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2/";

/// Authenticated JSON client shared by the service wrappers
#[derive(Clone)]
pub struct GoogleApiClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

impl std::fmt::Debug for GoogleApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleApiClient").finish_non_exhaustive()
    }
}

impl GoogleApiClient {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenSource>) -> Self {
        Self { http, tokens }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub async fn bearer_token(&self) -> CloudResult<String> {
        self.tokens.access_token().await
    }

    /// Send one request and parse the JSON response body
    pub async fn send_json(
        &self,
        service: &str,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> CloudResult<Value> {
        let token = self.tokens.access_token().await?;
        debug!(service = %service, method = %method, url = %url, "Calling cloud API");

        let mut request = self.http.request(method.clone(), url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CloudError::transport(service, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let text = response
                .text()
                .await
                .map_err(|e| CloudError::transport(service, e.to_string()))?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&text).map_err(|e| CloudError::invalid_response(service, e.to_string()))
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            if status.as_u16() != 404 {
                error!(service = %service, status = %status, error = %error_text, "Cloud API request failed");
            }
            Err(CloudError::Http {
                service: service.to_string(),
                status: status.as_u16(),
                message: error_text,
            })
        }
    }
}

/// Build `base` + path segments, percent-encoding each segment
pub(crate) fn api_url(service: &str, base: &str, segments: &[&str]) -> CloudResult<Url> {
    let mut url = Url::parse(base).map_err(|e| CloudError::transport(service, e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| CloudError::transport(service, "base URL cannot carry a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

pub(crate) fn export_context_body(request: &CsvExportRequest) -> Value {
    json!({
        "exportContext": {
            "kind": "sql#exportContext",
            "fileType": "CSV",
            "uri": request.uri,
            "databases": [request.database],
            "sqlExportOptions": {
                "tables": request.tables,
                "schemaOnly": false,
            },
            "csvExportOptions": {
                "selectQuery": request.select_query,
            },
        }
    })
}

pub(crate) fn import_context_body(request: &CsvImportRequest) -> Value {
    json!({
        "importContext": {
            "kind": "sql#importContext",
            "fileType": "CSV",
            "uri": request.uri,
            "database": request.database,
            "csvImportOptions": {
                "table": request.table,
            },
        }
    })
}

pub(crate) fn load_job_body(request: &WarehouseLoadRequest) -> Value {
    json!({
        "jobReference": {
            "projectId": request.project,
            "location": request.location,
        },
        "configuration": {
            "load": {
                "sourceUris": [request.source_uri],
                "sourceFormat": "CSV",
                "skipLeadingRows": 1,
                "schema": { "fields": request.schema },
                "destinationTable": {
                    "projectId": request.project,
                    "datasetId": request.dataset_id,
                    "tableId": request.table_id,
                },
                "writeDisposition": "WRITE_TRUNCATE",
            }
        }
    })
}

/// SQL admin API (v1beta4)
#[derive(Debug, Clone)]
pub struct CloudSqlAdmin {
    api: GoogleApiClient,
}

impl CloudSqlAdmin {
    const SERVICE: &'static str = "sqladmin";

    pub fn new(api: GoogleApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl SqlAdmin for CloudSqlAdmin {
    async fn instance_details(&self, project: &str) -> CloudResult<InstanceDetails> {
        let url = api_url(Self::SERVICE, SQL_ADMIN_BASE, &["projects", project, "instances"])?;
        let response = self.api.send_json(Self::SERVICE, Method::GET, url, None).await?;

        let first = response["items"]
            .as_array()
            .and_then(|items| items.first())
            .ok_or_else(|| CloudError::NoInstance {
                project: project.to_string(),
            })?;

        let instance = first["name"]
            .as_str()
            .ok_or_else(|| CloudError::invalid_response(Self::SERVICE, "instance without a name"))?;
        let service_account_email = first["serviceAccountEmailAddress"]
            .as_str()
            .unwrap_or_default();

        Ok(InstanceDetails {
            project: project.to_string(),
            instance: instance.to_string(),
            service_account_email: service_account_email.to_string(),
        })
    }

    async fn most_recent_operation_done(&self, project: &str, instance: &str) -> CloudResult<bool> {
        let mut url = api_url(Self::SERVICE, SQL_ADMIN_BASE, &["projects", project, "operations"])?;
        url.query_pairs_mut()
            .append_pair("instance", instance)
            .append_pair("maxResults", "1");

        let response = self.api.send_json(Self::SERVICE, Method::GET, url, None).await?;
        let status = response["items"]
            .as_array()
            .and_then(|items| items.first())
            .and_then(|operation| operation["status"].as_str());

        debug!(project = %project, instance = %instance, status = ?status, "Most recent SQL operation");
        Ok(status.map_or(true, |status| status == "DONE"))
    }

    async fn start_export(&self, project: &str, instance: &str, request: &CsvExportRequest) -> CloudResult<()> {
        let url = api_url(
            Self::SERVICE,
            SQL_ADMIN_BASE,
            &["projects", project, "instances", instance, "export"],
        )?;
        self.api
            .send_json(Self::SERVICE, Method::POST, url, Some(&export_context_body(request)))
            .await?;
        info!(project = %project, instance = %instance, uri = %request.uri, "SQL export started");
        Ok(())
    }

    async fn start_import(&self, project: &str, instance: &str, request: &CsvImportRequest) -> CloudResult<()> {
        let url = api_url(
            Self::SERVICE,
            SQL_ADMIN_BASE,
            &["projects", project, "instances", instance, "import"],
        )?;
        self.api
            .send_json(Self::SERVICE, Method::POST, url, Some(&import_context_body(request)))
            .await?;
        info!(project = %project, instance = %instance, table = %request.table, "SQL import started");
        Ok(())
    }
}

/// Object storage JSON API
#[derive(Debug, Clone)]
pub struct CloudStorage {
    api: GoogleApiClient,
}

impl CloudStorage {
    const SERVICE: &'static str = "storage";

    pub fn new(api: GoogleApiClient) -> Self {
        Self { api }
    }

    async fn has_role(&self, acl_url: Url, role: &str) -> CloudResult<bool> {
        match self.api.send_json(Self::SERVICE, Method::GET, acl_url, None).await {
            Ok(entry) => Ok(entry["role"].as_str() == Some(role)),
            // Absent from the ACL
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ObjectStorage for CloudStorage {
    async fn ensure_bucket(&self, project: &str, bucket: &str, location: &str) -> CloudResult<()> {
        let url = api_url(Self::SERVICE, STORAGE_BASE, &["b", bucket])?;
        match self.api.send_json(Self::SERVICE, Method::GET, url, None).await {
            Ok(_) => {
                debug!(bucket = %bucket, "Storage bucket acquired");
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut url = api_url(Self::SERVICE, STORAGE_BASE, &["b"])?;
        url.query_pairs_mut().append_pair("project", project);
        let body = json!({ "name": bucket, "location": location, "storageClass": "STANDARD" });
        self.api
            .send_json(Self::SERVICE, Method::POST, url, Some(&body))
            .await?;
        info!(bucket = %bucket, project = %project, "Storage bucket created");
        Ok(())
    }

    async fn grant_bucket_writer(&self, bucket: &str, email: &str) -> CloudResult<()> {
        let entity = format!("user-{email}");
        let acl_url = api_url(Self::SERVICE, STORAGE_BASE, &["b", bucket, "acl", &entity])?;
        if self.has_role(acl_url, "WRITER").await? {
            return Ok(());
        }

        info!(bucket = %bucket, email = %email, "Adding bucket WRITER");
        let url = api_url(Self::SERVICE, STORAGE_BASE, &["b", bucket, "acl"])?;
        let body = json!({ "entity": entity, "role": "WRITER" });
        self.api
            .send_json(Self::SERVICE, Method::POST, url, Some(&body))
            .await?;
        Ok(())
    }

    async fn grant_object_reader(&self, bucket: &str, object: &str, email: &str) -> CloudResult<()> {
        let entity = format!("user-{email}");
        let acl_url = api_url(
            Self::SERVICE,
            STORAGE_BASE,
            &["b", bucket, "o", object, "acl", &entity],
        )?;
        if self.has_role(acl_url, "READER").await? {
            return Ok(());
        }

        info!(bucket = %bucket, object = %object, email = %email, "Adding object READER");
        let url = api_url(Self::SERVICE, STORAGE_BASE, &["b", bucket, "o", object, "acl"])?;
        let body = json!({ "entity": entity, "role": "READER" });
        self.api
            .send_json(Self::SERVICE, Method::POST, url, Some(&body))
            .await?;
        Ok(())
    }
}

/// Warehouse REST API (v2)
#[derive(Debug, Clone)]
pub struct BigQueryWarehouse {
    api: GoogleApiClient,
}

impl BigQueryWarehouse {
    const SERVICE: &'static str = "bigquery";

    pub fn new(api: GoogleApiClient) -> Self {
        Self { api }
    }

    async fn exists(&self, url: Url) -> CloudResult<bool> {
        match self.api.send_json(Self::SERVICE, Method::GET, url, None).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn ensure_dataset(&self, project: &str, dataset_id: &str, location: &str) -> CloudResult<()> {
        let url = api_url(
            Self::SERVICE,
            BIGQUERY_BASE,
            &["projects", project, "datasets", dataset_id],
        )?;
        if self.exists(url).await? {
            return Ok(());
        }

        let url = api_url(Self::SERVICE, BIGQUERY_BASE, &["projects", project, "datasets"])?;
        let body = json!({
            "datasetReference": { "projectId": project, "datasetId": dataset_id },
            "location": location,
        });
        self.api
            .send_json(Self::SERVICE, Method::POST, url, Some(&body))
            .await?;
        info!(dataset = %dataset_id, "Warehouse dataset created");
        Ok(())
    }

    async fn ensure_table(
        &self,
        project: &str,
        dataset_id: &str,
        table_id: &str,
        schema: &[WarehouseField],
        location: &str,
    ) -> CloudResult<()> {
        let url = api_url(
            Self::SERVICE,
            BIGQUERY_BASE,
            &["projects", project, "datasets", dataset_id, "tables", table_id],
        )?;
        if self.exists(url).await? {
            return Ok(());
        }

        let url = api_url(
            Self::SERVICE,
            BIGQUERY_BASE,
            &["projects", project, "datasets", dataset_id, "tables"],
        )?;
        let body = json!({
            "tableReference": { "projectId": project, "datasetId": dataset_id, "tableId": table_id },
            "schema": { "fields": schema },
            "location": location,
        });
        self.api
            .send_json(Self::SERVICE, Method::POST, url, Some(&body))
            .await?;
        info!(table = %table_id, "Warehouse table created");
        Ok(())
    }

    async fn load_csv(&self, request: &WarehouseLoadRequest) -> CloudResult<String> {
        let url = api_url(
            Self::SERVICE,
            BIGQUERY_BASE,
            &["projects", &request.project, "jobs"],
        )?;
        let response = self
            .api
            .send_json(Self::SERVICE, Method::POST, url, Some(&load_job_body(request)))
            .await?;

        let job_id = response["jobReference"]["jobId"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        info!(job_id = %job_id, table = %request.table_id, "Warehouse load job created");
        Ok(job_id)
    }
}
