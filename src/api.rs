//! Client for the clinical REST API.
//!
//! Authentication state is an explicit [`Session`] value: [`ApiClient::login`]
//! creates it, every authenticated call takes it by reference, and
//! [`Session::logout`] consumes it. Nothing is kept in process-wide storage.
//!
//! Successful responses are wrapped as `{"success", "data", "message"}`,
//! failures as `{"error", "message", "code"}`; failures surface as
//! [`OurError::Api`] carrying the server message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::{OurError, OurResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub is_active: bool,
}

/// Authenticated API session
#[derive(Clone, PartialEq)]
pub struct Session {
    token: String,
    user: User,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("user", &self.user.username)
            .finish()
    }
}

impl Session {
    pub fn new(token: impl Into<String>, user: User) -> Self {
        Self {
            token: token.into(),
            user,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// End the session; the token is dropped with it
    pub fn logout(self) {
        info!("User {} logged out", self.user.username);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LoginResponse {
    token: String,
    user: User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub middle_name: String,
    pub date_of_birth: Option<DateTime<Utc>>,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewPatient {
    pub first_name: String,
    pub last_name: String,
    pub middle_name: String,
    pub date_of_birth: DateTime<Utc>,
    pub gender: String,
    pub phone: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatientUpdate {
    pub first_name: String,
    pub last_name: String,
    pub middle_name: String,
    pub phone: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Examination {
    pub id: String,
    pub patient_id: String,
    #[serde(default)]
    pub doctor_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub images: Option<Vec<String>>,
    pub created_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewExamination {
    pub patient_id: String,
    pub doctor_id: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub examination_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub diagnosis: String,
    #[serde(default)]
    pub recommendations: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewReport {
    pub examination_id: String,
    pub title: String,
    pub content: String,
    pub summary: String,
    pub diagnosis: String,
    pub recommendations: String,
    pub generated_by: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportUpdate {
    pub content: String,
    pub summary: String,
    pub diagnosis: String,
    pub recommendations: String,
}

/// Paging for list endpoints
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 10,
            offset: 0,
        }
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

#[derive(Serialize)]
struct AttachPhotos<'a> {
    photos: &'a [String],
}

/// HTTP client bound to the API origin
#[derive(Debug, Clone)]
pub struct ApiClient {
    base: Url,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(api_base_url: &Url, timeout: Duration) -> OurResult<Self> {
        let base = api_base_url.join("api/")?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base, client })
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        session: Option<&Session>,
    ) -> OurResult<RequestBuilder> {
        let url = self.base.join(path)?;
        debug!("{method} {url}");
        let builder = self.client.request(method, url);
        Ok(match session {
            Some(session) => builder.bearer_auth(session.token()),
            None => builder,
        })
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> OurResult<Option<T>> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&body)
                .ok()
                .and_then(|body| body.message.or(body.error))
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| format!("Request failed with status: {status}"));
            return Err(OurError::Api {
                status: status.as_u16(),
                message,
            });
        }

        if body.is_empty() {
            return Ok(None);
        }
        let envelope: Envelope<T> = serde_json::from_slice(&body)?;
        Ok(envelope.data)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> OurResult<T> {
        self.execute(request)
            .await?
            .ok_or_else(|| OurError::App("API response carried no data".to_string()))
    }

    async fn fetch_list<T: DeserializeOwned>(&self, request: RequestBuilder) -> OurResult<Vec<T>> {
        Ok(self.execute(request).await?.unwrap_or_default())
    }

    async fn acknowledge(&self, request: RequestBuilder) -> OurResult<()> {
        self.execute::<serde_json::Value>(request).await?;
        Ok(())
    }

    pub async fn login(&self, credentials: &Credentials) -> OurResult<Session> {
        let request = self
            .request(Method::POST, "auth/login", None)?
            .json(credentials);
        let response: LoginResponse = self.fetch(request).await?;
        info!("Logged in as {}", response.user.username);
        Ok(Session::new(response.token, response.user))
    }

    pub async fn register(&self, registration: &Registration) -> OurResult<User> {
        let request = self
            .request(Method::POST, "auth/register", None)?
            .json(registration);
        self.fetch(request).await
    }

    pub async fn list_patients(&self, session: &Session, page: Page) -> OurResult<Vec<Patient>> {
        let request = self
            .request(Method::GET, "patients", Some(session))?
            .query(&page);
        self.fetch_list(request).await
    }

    pub async fn get_patient(&self, session: &Session, id: &str) -> OurResult<Patient> {
        let request = self.request(Method::GET, &format!("patients/{id}"), Some(session))?;
        self.fetch(request).await
    }

    pub async fn create_patient(
        &self,
        session: &Session,
        patient: &NewPatient,
    ) -> OurResult<Patient> {
        let request = self
            .request(Method::POST, "patients", Some(session))?
            .json(patient);
        self.fetch(request).await
    }

    pub async fn update_patient(
        &self,
        session: &Session,
        id: &str,
        update: &PatientUpdate,
    ) -> OurResult<Patient> {
        let request = self
            .request(Method::PUT, &format!("patients/{id}"), Some(session))?
            .json(update);
        self.fetch(request).await
    }

    pub async fn delete_patient(&self, session: &Session, id: &str) -> OurResult<()> {
        let request = self.request(Method::DELETE, &format!("patients/{id}"), Some(session))?;
        self.acknowledge(request).await
    }

    pub async fn list_examinations(
        &self,
        session: &Session,
        page: Page,
    ) -> OurResult<Vec<Examination>> {
        let request = self
            .request(Method::GET, "examinations", Some(session))?
            .query(&page);
        self.fetch_list(request).await
    }

    pub async fn get_examination(&self, session: &Session, id: &str) -> OurResult<Examination> {
        let request = self.request(Method::GET, &format!("examinations/{id}"), Some(session))?;
        self.fetch(request).await
    }

    pub async fn create_examination(
        &self,
        session: &Session,
        examination: &NewExamination,
    ) -> OurResult<Examination> {
        let request = self
            .request(Method::POST, "examinations", Some(session))?
            .json(examination);
        self.fetch(request).await
    }

    pub async fn patient_examinations(
        &self,
        session: &Session,
        patient_id: &str,
    ) -> OurResult<Vec<Examination>> {
        let request = self.request(
            Method::GET,
            &format!("examinations/patient/{patient_id}"),
            Some(session),
        )?;
        self.fetch_list(request).await
    }

    pub async fn attach_photos(
        &self,
        session: &Session,
        examination_id: &str,
        filenames: &[String],
    ) -> OurResult<()> {
        let request = self
            .request(
                Method::POST,
                &format!("examinations/{examination_id}/photos"),
                Some(session),
            )?
            .json(&AttachPhotos { photos: filenames });
        self.acknowledge(request).await
    }

    pub async fn start_analysis(&self, session: &Session, examination_id: &str) -> OurResult<()> {
        let request = self.request(
            Method::POST,
            &format!("examinations/{examination_id}/analyze"),
            Some(session),
        )?;
        self.acknowledge(request).await
    }

    pub async fn list_reports(&self, session: &Session, page: Page) -> OurResult<Vec<Report>> {
        let request = self
            .request(Method::GET, "reports", Some(session))?
            .query(&page);
        self.fetch_list(request).await
    }

    pub async fn get_report(&self, session: &Session, id: &str) -> OurResult<Report> {
        let request = self.request(Method::GET, &format!("reports/{id}"), Some(session))?;
        self.fetch(request).await
    }

    pub async fn examination_report(
        &self,
        session: &Session,
        examination_id: &str,
    ) -> OurResult<Report> {
        let request = self.request(
            Method::GET,
            &format!("reports/examination/{examination_id}"),
            Some(session),
        )?;
        self.fetch(request).await
    }

    pub async fn create_report(&self, session: &Session, report: &NewReport) -> OurResult<Report> {
        let request = self
            .request(Method::POST, "reports", Some(session))?
            .json(report);
        self.fetch(request).await
    }

    pub async fn update_report(
        &self,
        session: &Session,
        id: &str,
        update: &ReportUpdate,
    ) -> OurResult<Report> {
        let request = self
            .request(Method::PUT, &format!("reports/{id}"), Some(session))?
            .json(update);
        self.fetch(request).await
    }
}

/// The two calls of the examination hand-off
#[async_trait]
pub trait ExaminationApi: Send + Sync {
    async fn attach_photos(&self, examination_id: &str, filenames: &[String]) -> OurResult<()>;
    async fn start_analysis(&self, examination_id: &str) -> OurResult<()>;
}

/// [`ApiClient`] paired with a logged-in [`Session`]
#[derive(Debug, Clone)]
pub struct AuthorizedApi {
    pub client: ApiClient,
    pub session: Session,
}

#[async_trait]
impl ExaminationApi for AuthorizedApi {
    async fn attach_photos(&self, examination_id: &str, filenames: &[String]) -> OurResult<()> {
        self.client
            .attach_photos(&self.session, examination_id, filenames)
            .await
    }

    async fn start_analysis(&self, examination_id: &str) -> OurResult<()> {
        self.client
            .start_analysis(&self.session, examination_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_api_prefix() {
        let base = Url::parse("http://localhost:8080").expect("valid url");
        let client = ApiClient::new(&base, Duration::from_secs(1)).expect("client");
        assert_eq!(client.base.as_str(), "http://localhost:8080/api/");
        assert_eq!(
            client.base.join("examinations/e1/photos").expect("join").as_str(),
            "http://localhost:8080/api/examinations/e1/photos"
        );
    }

    #[test]
    fn test_session_debug_hides_token() {
        let session = Session::new(
            "secret-token",
            User {
                id: "u1".to_string(),
                username: "doctor".to_string(),
                email: String::new(),
                role: "doctor".to_string(),
                first_name: String::new(),
                last_name: String::new(),
                is_active: true,
            },
        );
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("doctor"));
    }
}
