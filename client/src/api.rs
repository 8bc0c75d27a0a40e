use futures_util::future::BoxFuture;
use roomscope_shared::{
    Bounds, ClusterRequest, ClusterResponse, LatLng, UserId, ViewportRoomsRequest,
    ViewportRoomsResponse,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::geo::expand_bounds;

/// Failure of a discovery request. No retry has been attempted.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Server responded with {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout(e.to_string())
        } else if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

/// Raw discovery endpoints
pub trait DiscoveryApi: Send + Sync + 'static {
    fn get_clusters(
        &self,
        request: ClusterRequest,
    ) -> BoxFuture<'_, Result<ClusterResponse, FetchError>>;

    fn get_viewport_rooms(
        &self,
        request: ViewportRoomsRequest,
    ) -> BoxFuture<'_, Result<ViewportRoomsResponse, FetchError>>;
}

/// `DiscoveryApi` over HTTP
pub struct HttpDiscoveryApi {
    client: reqwest::Client,
    api_base: String,
    user_id: Option<UserId>,
}

impl HttpDiscoveryApi {
    pub fn new(
        api_base: impl Into<String>,
        user_id: Option<UserId>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            user_id,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(format!("{}{}", self.api_base, path));
        match &self.user_id {
            Some(user_id) => request.header("X-User-Id", user_id.as_str()),
            None => request,
        }
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, FetchError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(FetchError::Status {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json()
        .await
        .map_err(|e| FetchError::Decode(e.to_string()))
}

impl DiscoveryApi for HttpDiscoveryApi {
    fn get_clusters(
        &self,
        request: ClusterRequest,
    ) -> BoxFuture<'_, Result<ClusterResponse, FetchError>> {
        Box::pin(async move {
            let response = self.get("/rooms/clusters").query(&request).send().await?;
            read_json(response).await
        })
    }

    fn get_viewport_rooms(
        &self,
        request: ViewportRoomsRequest,
    ) -> BoxFuture<'_, Result<ViewportRoomsResponse, FetchError>> {
        Box::pin(async move {
            let response = self.get("/rooms/viewport").query(&request).send().await?;
            read_json(response).await
        })
    }
}

/// Prepares discovery queries (bounds expansion, zoom bucketing) and hands
/// them to a [`DiscoveryApi`].
pub struct ClusterClient<A> {
    api: Arc<A>,
    expand_factor: f64,
}

impl<A> Clone for ClusterClient<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            expand_factor: self.expand_factor,
        }
    }
}

impl<A: DiscoveryApi> ClusterClient<A> {
    pub fn new(api: A, expand_factor: f64) -> Self {
        Self::from_arc(Arc::new(api), expand_factor)
    }

    pub fn from_arc(api: Arc<A>, expand_factor: f64) -> Self {
        Self { api, expand_factor }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Build the wire request for a clustering fetch.
    ///
    /// With `expand` the bounds grow by the configured factor so small pans
    /// stay inside already fetched data; the zoom is floored to the server's
    /// integer bucket.
    pub fn cluster_request(
        &self,
        bounds: &Bounds,
        zoom: f64,
        category: Option<&str>,
        user_location: Option<LatLng>,
        expand: bool,
    ) -> ClusterRequest {
        let bounds = if expand {
            expand_bounds(bounds, self.expand_factor)
        } else {
            *bounds
        };
        ClusterRequest {
            min_lng: bounds.west,
            min_lat: bounds.south,
            max_lng: bounds.east,
            max_lat: bounds.north,
            zoom: zoom.floor().max(0.0) as u32,
            category: category.map(str::to_string),
            user_lat: user_location.map(|l| l.latitude),
            user_lng: user_location.map(|l| l.longitude),
        }
    }

    pub async fn fetch_clusters(
        &self,
        bounds: &Bounds,
        zoom: f64,
        category: Option<&str>,
        user_location: Option<LatLng>,
        expand: bool,
    ) -> Result<ClusterResponse, FetchError> {
        let request = self.cluster_request(bounds, zoom, category, user_location, expand);
        let zoom = request.zoom;
        let response = self.api.get_clusters(request).await?;
        let metadata = &response.metadata;
        debug!(
            zoom,
            clusters = metadata.cluster_count,
            individual = metadata.individual_count,
            total = metadata.total_rooms,
            processing_ms = metadata.processing_time_ms,
            "Fetched clusters"
        );
        Ok(response)
    }

    /// One page of the flat room list for `bounds`. Never expanded.
    pub async fn fetch_viewport_rooms(
        &self,
        bounds: &Bounds,
        user_location: Option<LatLng>,
        category: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<ViewportRoomsResponse, FetchError> {
        let request = ViewportRoomsRequest {
            min_lng: bounds.west,
            min_lat: bounds.south,
            max_lng: bounds.east,
            max_lat: bounds.north,
            user_lat: user_location.map(|l| l.latitude),
            user_lng: user_location.map(|l| l.longitude),
            category: category.map(str::to_string),
            page,
            page_size,
        };
        let response = self.api.get_viewport_rooms(request).await?;
        debug!(
            page,
            rooms = response.rooms.len(),
            total = response.total_elements,
            has_next = response.has_next,
            "Fetched viewport rooms"
        );
        Ok(response)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted in-memory `DiscoveryApi`
    #[derive(Default)]
    pub struct FakeApi {
        cluster_replies: Mutex<VecDeque<(Duration, Result<ClusterResponse, FetchError>)>>,
        room_replies: Mutex<VecDeque<Result<ViewportRoomsResponse, FetchError>>>,
        cluster_calls: Mutex<Vec<ClusterRequest>>,
        room_calls: Mutex<Vec<ViewportRoomsRequest>>,
    }

    impl FakeApi {
        pub fn reply_clusters(&self, reply: Result<ClusterResponse, FetchError>) {
            self.reply_clusters_after(Duration::ZERO, reply);
        }

        pub fn reply_clusters_after(
            &self,
            delay: Duration,
            reply: Result<ClusterResponse, FetchError>,
        ) {
            self.cluster_replies.lock().unwrap().push_back((delay, reply));
        }

        pub fn reply_rooms(&self, reply: Result<ViewportRoomsResponse, FetchError>) {
            self.room_replies.lock().unwrap().push_back(reply);
        }

        pub fn cluster_calls(&self) -> Vec<ClusterRequest> {
            self.cluster_calls.lock().unwrap().clone()
        }

        pub fn room_calls(&self) -> Vec<ViewportRoomsRequest> {
            self.room_calls.lock().unwrap().clone()
        }
    }

    impl DiscoveryApi for FakeApi {
        fn get_clusters(
            &self,
            request: ClusterRequest,
        ) -> BoxFuture<'_, Result<ClusterResponse, FetchError>> {
            self.cluster_calls.lock().unwrap().push(request);
            let (delay, reply) = self
                .cluster_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((Duration::ZERO, Ok(ClusterResponse::default())));
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                reply
            })
        }

        fn get_viewport_rooms(
            &self,
            request: ViewportRoomsRequest,
        ) -> BoxFuture<'_, Result<ViewportRoomsResponse, FetchError>> {
            self.room_calls.lock().unwrap().push(request);
            let reply = self
                .room_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ViewportRoomsResponse::default()));
            Box::pin(async move { reply })
        }
    }
}
