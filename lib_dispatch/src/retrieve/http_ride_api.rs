//! [`RideApi`] over the retrying [`ApiClient`].

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::de::IgnoredAny;
use serde::Serialize;

use crate::error::ActionError;
use crate::models::events::LocationUpdate;
use crate::models::ride::{NewRide, RideRecord};
use crate::retrieve::ky_http::{ApiClient, ApiClientError};
use crate::retrieve::ride_api::{AcceptBody, CancelBody, RejectBody, RideApi};

impl From<ApiClientError> for ActionError {
    fn from(err: ApiClientError) -> Self {
        match err {
            ApiClientError::Body(e) if e.is_decode() => ActionError::Decode(e.to_string()),
            ApiClientError::Decode(e) => ActionError::Decode(e.to_string()),
            other => ActionError::Network(other.to_string()),
        }
    }
}

pub struct HttpRideApi {
    client: ApiClient,
}

impl HttpRideApi {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, ApiClientError> {
        Ok(Self::from_client(ApiClient::new(base_url, auth_token)?))
    }

    pub fn from_client(client: ApiClient) -> Self {
        Self { client }
    }

    async fn call<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ActionError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized + Sync,
    {
        let response = self
            .client
            .request::<T, B>(method.clone(), path, None, body)
            .await
            .map_err(|e| {
                tracing::warn!(%method, path, error = %e, "ride api call failed");
                ActionError::from(e)
            })?;

        if !response.success {
            let message = response.error_body.unwrap_or_default();
            tracing::warn!(%method, path, status = response.status, %message, "ride api call rejected");
            return Err(ActionError::ServerRejected {
                status: response.status,
                message,
            });
        }
        response
            .data
            .ok_or_else(|| ActionError::Decode("missing response body".to_string()))
    }
}

fn ride_path(ride_id: &str, action: &str) -> String {
    format!("rides/{}/{}", ride_id, action)
}

#[async_trait]
impl RideApi for HttpRideApi {
    async fn request_ride(&self, ride: &NewRide) -> Result<RideRecord, ActionError> {
        self.call(Method::POST, "rides/request", Some(ride)).await
    }

    async fn accept_ride(&self, ride_id: &str, body: &AcceptBody) -> Result<RideRecord, ActionError> {
        self.call(Method::PUT, &ride_path(ride_id, "accept"), Some(body)).await
    }

    async fn reject_ride(&self, ride_id: &str, body: &RejectBody) -> Result<(), ActionError> {
        self.call::<IgnoredAny, _>(Method::PUT, &ride_path(ride_id, "reject"), Some(body))
            .await
            .map(|_| ())
    }

    async fn start_ride(&self, ride_id: &str) -> Result<RideRecord, ActionError> {
        self.call::<_, ()>(Method::PUT, &ride_path(ride_id, "start"), None).await
    }

    async fn complete_ride(&self, ride_id: &str) -> Result<RideRecord, ActionError> {
        self.call::<_, ()>(Method::PUT, &ride_path(ride_id, "complete"), None).await
    }

    async fn cancel_ride(&self, ride_id: &str, body: &CancelBody) -> Result<(), ActionError> {
        self.call::<IgnoredAny, _>(Method::PUT, &ride_path(ride_id, "cancel"), Some(body))
            .await
            .map(|_| ())
    }

    async fn update_location(&self, update: &LocationUpdate) -> Result<(), ActionError> {
        self.call::<IgnoredAny, _>(
            Method::PUT,
            &ride_path(&update.ride_id, "location"),
            Some(update),
        )
        .await
        .map(|_| ())
    }

    async fn get_ride(&self, ride_id: &str) -> Result<RideRecord, ActionError> {
        self.call::<_, ()>(Method::GET, &format!("rides/{}", ride_id), None).await
    }

    async fn pending_rides(&self) -> Result<Vec<RideRecord>, ActionError> {
        self.call::<_, ()>(Method::GET, "rides/pending", None).await
    }
}
