// ABOUTME: Google Sheets row sink over the Sheets v4 REST API
// ABOUTME: Reads values, batch-updates rows, appends single rows and deletes rows by index

use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;

use super::layout::a1_row_range;
use super::{RowSink, RowUpdate};
use crate::error::{SinkPhase, SyncError, SyncResult};

pub const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com";

/// Connection settings for one worksheet.
#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub api_base: String,
    pub spreadsheet_id: String,
    pub worksheet: String,
    /// OAuth bearer token (obtained outside this tool)
    pub access_token: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

pub struct SheetsSink {
    client: Client,
    config: SheetsConfig,
    /// Numeric grid id of the worksheet, needed for row deletion
    sheet_id: Mutex<Option<i64>>,
}

/// Quote a worksheet title for use in A1 notation when needed.
pub fn quote_sheet_name(title: &str) -> String {
    if !title.is_empty() && title.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        title.to_string()
    } else {
        format!("'{}'", title.replace('\'', "''"))
    }
}

fn cell_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

impl SheetsSink {
    pub fn new(config: SheetsConfig) -> SyncResult<Self> {
        if config.access_token.trim().is_empty() {
            return Err(SyncError::SinkAuth(format!(
                "no access token configured for spreadsheet {}",
                config.spreadsheet_id
            )));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            sheet_id: Mutex::new(None),
        })
    }

    /// URL under `/v4/spreadsheets/{id}` with the given extra path segments.
    fn url(&self, segments: &[&str]) -> SyncResult<url::Url> {
        let mut url = url::Url::parse(&self.config.api_base)
            .map_err(|e| SyncError::Config(format!("invalid Sheets API base URL: {}", e)))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| SyncError::Config("Sheets API base URL cannot have a path".to_string()))?;
            path.pop_if_empty().push("v4").push("spreadsheets");
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn range(&self, a1: Option<&str>) -> String {
        let sheet = quote_sheet_name(&self.config.worksheet);
        match a1 {
            Some(a1) => format!("{}!{}", sheet, a1),
            None => sheet,
        }
    }

    /// Turn a response into success, auth failure or a phase-tagged write error.
    async fn check(response: Response, phase: SinkPhase) -> SyncResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::SinkAuth(format!("HTTP {}: {}", status, body)));
        }
        Err(SyncError::sink_write(phase, format!("HTTP {}: {}", status, body)))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        phase: SinkPhase,
    ) -> SyncResult<Response> {
        let response = request
            .bearer_auth(&self.config.access_token)
            .send()
            .await
            .map_err(|e| SyncError::sink_write(phase, e.to_string()))?;
        Self::check(response, phase).await
    }

    async fn spreadsheet_batch_update(
        &self,
        requests: serde_json::Value,
        phase: SinkPhase,
    ) -> SyncResult<serde_json::Value> {
        let id_segment = format!("{}:batchUpdate", self.config.spreadsheet_id);
        let url = self.url(&[id_segment.as_str()])?;
        let response = self
            .send(
                self.client.post(url).json(&json!({ "requests": requests })),
                phase,
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::sink_write(phase, format!("invalid batchUpdate response: {}", e)))
    }

    /// Resolve the worksheet's grid id, creating the worksheet if it is missing.
    async fn resolve_sheet_id(&self) -> SyncResult<i64> {
        if let Some(id) = *self.sheet_id.lock().unwrap_or_else(|e| e.into_inner()) {
            return Ok(id);
        }

        let mut url = self.url(&[self.config.spreadsheet_id.as_str()])?;
        url.query_pairs_mut().append_pair("fields", "sheets.properties");
        let meta: SpreadsheetMeta = self
            .send(self.client.get(url), SinkPhase::Scan)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::sink_write(SinkPhase::Scan, format!("invalid spreadsheet metadata: {}", e)))?;

        let id = match meta
            .sheets
            .iter()
            .find(|s| s.properties.title == self.config.worksheet)
        {
            Some(sheet) => sheet.properties.sheet_id,
            None => {
                tracing::info!(
                    "Worksheet '{}' not found, creating it",
                    self.config.worksheet
                );
                let reply = self
                    .spreadsheet_batch_update(
                        json!([{ "addSheet": { "properties": {
                            "title": self.config.worksheet,
                            "gridProperties": { "rowCount": 1000, "columnCount": 20 }
                        }}}]),
                        SinkPhase::Update,
                    )
                    .await?;
                reply["replies"][0]["addSheet"]["properties"]["sheetId"]
                    .as_i64()
                    .ok_or_else(|| {
                        SyncError::sink_write(SinkPhase::Update, "addSheet reply has no sheetId")
                    })?
            }
        };

        *self.sheet_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
        Ok(id)
    }
}

impl RowSink for SheetsSink {
    fn describe(&self) -> String {
        format!(
            "sheets:{}/{}",
            self.config.spreadsheet_id, self.config.worksheet
        )
    }

    async fn prepare(&self) -> SyncResult<()> {
        let id = self.resolve_sheet_id().await?;
        tracing::info!("Using worksheet '{}' (id {})", self.config.worksheet, id);
        Ok(())
    }

    async fn read_all_rows(&self) -> SyncResult<Vec<Vec<String>>> {
        let range = self.range(None);
        let mut url = self.url(&[self.config.spreadsheet_id.as_str(), "values", range.as_str()])?;
        url.query_pairs_mut().append_pair("majorDimension", "ROWS");

        let values: ValueRange = self
            .send(self.client.get(url), SinkPhase::Scan)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::sink_write(SinkPhase::Scan, format!("invalid values response: {}", e)))?;

        Ok(values
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_string).collect())
            .collect())
    }

    async fn batch_update(&self, updates: &[RowUpdate]) -> SyncResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let data: Vec<serde_json::Value> = updates
            .iter()
            .map(|u| {
                json!({
                    "range": self.range(Some(&a1_row_range(u.row, u.values.len()))),
                    "values": [u.values],
                })
            })
            .collect();

        let url = self.url(&[self.config.spreadsheet_id.as_str(), "values:batchUpdate"])?;
        self.send(
            self.client
                .post(url)
                .json(&json!({ "valueInputOption": "RAW", "data": data })),
            SinkPhase::Update,
        )
        .await?;
        Ok(())
    }

    async fn append_row(&self, values: &[String]) -> SyncResult<()> {
        let range = format!("{}:append", self.range(Some("A1")));
        let mut url = self.url(&[self.config.spreadsheet_id.as_str(), "values", range.as_str()])?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");

        self.send(
            self.client.post(url).json(&json!({ "values": [values] })),
            SinkPhase::Append,
        )
        .await?;
        Ok(())
    }

    async fn delete_row(&self, row_number: usize) -> SyncResult<()> {
        if row_number < 2 {
            return Err(SyncError::sink_write(
                SinkPhase::Delete,
                format!("refusing to delete header row {}", row_number),
            ));
        }
        let sheet_id = self.resolve_sheet_id().await?;
        self.spreadsheet_batch_update(
            json!([{ "deleteDimension": { "range": {
                "sheetId": sheet_id,
                "dimension": "ROWS",
                "startIndex": row_number - 1,
                "endIndex": row_number
            }}}]),
            SinkPhase::Delete,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sink_for(server: &MockServer) -> SheetsSink {
        SheetsSink::new(SheetsConfig {
            api_base: server.uri(),
            spreadsheet_id: "sheet123".to_string(),
            worksheet: "Hoja1".to_string(),
            access_token: "token-abc".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_quote_sheet_name() {
        assert_eq!(quote_sheet_name("Hoja1"), "Hoja1");
        assert_eq!(quote_sheet_name("Citas 2025"), "'Citas 2025'");
        assert_eq!(quote_sheet_name("Dr's"), "'Dr''s'");
    }

    #[test]
    fn test_missing_token_is_auth_error() {
        let result = SheetsSink::new(SheetsConfig {
            api_base: DEFAULT_API_BASE.to_string(),
            spreadsheet_id: "x".to_string(),
            worksheet: "Hoja1".to_string(),
            access_token: String::new(),
            timeout: Duration::from_secs(5),
        });
        assert!(matches!(result, Err(SyncError::SinkAuth(_))));
    }

    #[tokio::test]
    async fn test_read_all_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/spreadsheets/sheet123/values/Hoja1"))
            .and(query_param("majorDimension", "ROWS"))
            .and(header("authorization", "Bearer token-abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "range": "Hoja1!A1:O3",
                "majorDimension": "ROWS",
                "values": [["Registro", "CitMod"], ["1", "t"], [15]]
            })))
            .mount(&server)
            .await;

        let rows = sink_for(&server).read_all_rows().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0], "Registro");
        assert_eq!(rows[2][0], "15");
    }

    #[tokio::test]
    async fn test_read_empty_sheet() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/spreadsheets/sheet123/values/Hoja1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "range": "Hoja1!A1:Z1000",
                "majorDimension": "ROWS"
            })))
            .mount(&server)
            .await;

        assert!(sink_for(&server).read_all_rows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_update_is_one_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v4/spreadsheets/sheet123/values:batchUpdate"))
            .and(body_json(json!({
                "valueInputOption": "RAW",
                "data": [
                    { "range": "Hoja1!A2:B2", "values": [["1", "x"]] },
                    { "range": "Hoja1!A5:B5", "values": [["4", "y"]] }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        sink_for(&server)
            .batch_update(&[
                RowUpdate {
                    row: 2,
                    values: vec!["1".to_string(), "x".to_string()],
                },
                RowUpdate {
                    row: 5,
                    values: vec!["4".to_string(), "y".to_string()],
                },
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_append_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v4/spreadsheets/sheet123/values/Hoja1!A1:append"))
            .and(query_param("valueInputOption", "RAW"))
            .and(query_param("insertDataOption", "INSERT_ROWS"))
            .and(body_json(json!({ "values": [["9", "z"]] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        sink_for(&server)
            .append_row(&["9".to_string(), "z".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_row_resolves_sheet_id_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/spreadsheets/sheet123"))
            .and(query_param("fields", "sheets.properties"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sheets": [
                    { "properties": { "sheetId": 0, "title": "Resumen" } },
                    { "properties": { "sheetId": 777, "title": "Hoja1" } }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v4/spreadsheets/sheet123:batchUpdate"))
            .and(body_json(json!({ "requests": [{ "deleteDimension": { "range": {
                "sheetId": 777, "dimension": "ROWS", "startIndex": 4, "endIndex": 5
            }}}]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "replies": [{}] })))
            .expect(2)
            .mount(&server)
            .await;

        let sink = sink_for(&server);
        sink.delete_row(5).await.unwrap();
        sink.delete_row(5).await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_creates_missing_worksheet() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/spreadsheets/sheet123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sheets": [{ "properties": { "sheetId": 0, "title": "Resumen" } }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v4/spreadsheets/sheet123:batchUpdate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "replies": [{ "addSheet": { "properties": { "sheetId": 42, "title": "Hoja1" } } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let sink = sink_for(&server);
        sink.prepare().await.unwrap();
        assert_eq!(sink.resolve_sheet_id().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_unauthorized_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
            .mount(&server)
            .await;

        let err = sink_for(&server).read_all_rows().await.unwrap_err();
        assert!(matches!(err, SyncError::SinkAuth(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_error_is_phase_tagged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let err = sink_for(&server)
            .append_row(&["1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::SinkWrite {
                phase: SinkPhase::Append,
                ..
            }
        ));
    }
}
