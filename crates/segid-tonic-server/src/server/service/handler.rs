//! gRPC entry point for ID allocation.
//!
//! [`AllocatorService`] implements the `segid.Allocator` service on top of a
//! shared [`SegmentAllocator`]. Each RPC validates its request, delegates to
//! the allocator, and maps failures to gRPC status codes through
//! [`segid_tonic_core::Error`].

use crate::server::{
    store::AnyStore,
    telemetry::{
        increment_ids_allocated, increment_request_errors, increment_requests,
        record_request_duration,
    },
};
use segid_tonic_core::{
    Error,
    proto::{
        AllocateIdRequest, AllocateIdResponse, AllocateIdsRequest, AllocateIdsResponse,
        DescribeTagRequest, DescribeTagResponse, allocator_server::Allocator,
    },
    segid::{self, SegmentAllocator, SegmentStore},
    types::describe_tag,
};
use std::{sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

/// gRPC service handing out IDs from one [`SegmentAllocator`].
///
/// Clones share the allocator and the shutdown state.
#[derive(Clone)]
pub struct AllocatorService {
    allocator: Arc<SegmentAllocator<AnyStore>>,
    max_batch_ids: u32,
    shutdown_token: CancellationToken,
}

impl AllocatorService {
    pub fn new(allocator: Arc<SegmentAllocator<AnyStore>>, max_batch_ids: u32) -> Self {
        Self {
            allocator,
            max_batch_ids,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Refuses new requests, then stops the allocator's refill workers.
    pub async fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new requests");
        self.shutdown_token.cancel();
        self.allocator.shutdown().await;
    }

    fn ensure_serving(&self) -> Result<(), Error> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        Ok(())
    }

    fn validate_count(&self, count: u32) -> Result<usize, Error> {
        if count == 0 {
            return Err(Error::InvalidRequest {
                reason: "Count must be greater than 0".to_string(),
            });
        }
        if count > self.max_batch_ids {
            return Err(Error::InvalidRequest {
                reason: format!(
                    "Count {count} exceeds maximum allowed ({})",
                    self.max_batch_ids
                ),
            });
        }
        Ok(count as usize)
    }
}

/// Records duration and errors for one call and converts the outcome.
fn respond<T>(
    method: &'static str,
    started: Instant,
    result: Result<T, Error>,
) -> Result<Response<T>, Status> {
    record_request_duration(method, started.elapsed().as_secs_f64() * 1_000.0);
    result.map(Response::new).map_err(|e| {
        #[cfg(feature = "tracing")]
        tracing::debug!(method, error = %e, "Request failed");
        let status = Status::from(e);
        increment_request_errors(method, status.code());
        status
    })
}

#[tonic::async_trait]
impl Allocator for AllocatorService {
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(tag = %req.get_ref().tag)))]
    async fn allocate_id(
        &self,
        req: Request<AllocateIdRequest>,
    ) -> Result<Response<AllocateIdResponse>, Status> {
        const METHOD: &str = "AllocateId";
        let started = Instant::now();
        increment_requests(METHOD);

        let result = async {
            self.ensure_serving()?;
            let id = self.allocator.next_id(&req.get_ref().tag).await?;
            increment_ids_allocated(1);
            Ok::<_, Error>(AllocateIdResponse { id })
        }
        .await;
        respond(METHOD, started, result)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(tag = %req.get_ref().tag, count = req.get_ref().count)))]
    async fn allocate_ids(
        &self,
        req: Request<AllocateIdsRequest>,
    ) -> Result<Response<AllocateIdsResponse>, Status> {
        const METHOD: &str = "AllocateIds";
        let started = Instant::now();
        increment_requests(METHOD);

        let result = async {
            self.ensure_serving()?;
            let AllocateIdsRequest { tag, count } = req.get_ref();
            let count = self.validate_count(*count)?;
            let ids = self.allocator.next_ids(tag, count).await?;
            increment_ids_allocated(ids.len() as u64);
            Ok::<_, Error>(AllocateIdsResponse { ids })
        }
        .await;
        respond(METHOD, started, result)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(tag = %req.get_ref().tag)))]
    async fn describe_tag(
        &self,
        req: Request<DescribeTagRequest>,
    ) -> Result<Response<DescribeTagResponse>, Status> {
        const METHOD: &str = "DescribeTag";
        let started = Instant::now();
        increment_requests(METHOD);

        let result = async {
            self.ensure_serving()?;
            let tag = &req.get_ref().tag;
            segid::validate_tag(tag)?;
            let record = self
                .allocator
                .store()
                .get_tag(tag)
                .await?
                .ok_or_else(|| segid::Error::UnknownTag { tag: tag.clone() })?;
            Ok::<_, Error>(describe_tag(record, self.allocator.snapshot(tag)))
        }
        .await;
        respond(METHOD, started, result)
    }
}
