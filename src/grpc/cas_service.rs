use tonic::{Code, Request, Response, Status};

use crate::action::ActionResult;
use crate::cache::{CacheGateway, Digest};
use crate::grpc::convert::{cache_error_code, required_digest};
use crate::proto::action_cache_server::ActionCache;
use crate::proto::content_addressable_storage_server::ContentAddressableStorage;
use crate::proto::{
    self, batch_read_blobs_response, batch_update_blobs_response, BatchReadBlobsRequest,
    BatchReadBlobsResponse, BatchUpdateBlobsRequest, BatchUpdateBlobsResponse,
    FindMissingBlobsRequest, FindMissingBlobsResponse, GetActionResultRequest,
    UpdateActionResultRequest,
};

/// Upper bound on the total payload of one batch request or response. Larger
/// blobs go through the byte stream service.
pub const MAX_BATCH_TOTAL_SIZE_BYTES: i64 = 4 * 1024 * 1024 - 64 * 1024;

/// Blob-level access to the content-addressable store.
/// Reject a batch whose sizes add up to more than
/// [`MAX_BATCH_TOTAL_SIZE_BYTES`]. Sizes may be client-declared, so the sum
/// is checked for overflow.
fn check_batch_size(mut sizes: impl Iterator<Item = i64>) -> Result<(), Status> {
    let total = sizes.try_fold(0i64, |acc, size| acc.checked_add(size));
    match total {
        Some(total) if total <= MAX_BATCH_TOTAL_SIZE_BYTES => Ok(()),
        Some(total) => Err(Status::invalid_argument(format!(
            "Batch of {} bytes exceeds the limit of {} bytes",
            total, MAX_BATCH_TOTAL_SIZE_BYTES
        ))),
        None => Err(Status::invalid_argument(format!(
            "Batch size overflows; the limit is {} bytes",
            MAX_BATCH_TOTAL_SIZE_BYTES
        ))),
    }
}

pub struct CasService {
    cache: CacheGateway,
}

impl CasService {
    pub fn new(cache: CacheGateway) -> Self {
        Self { cache }
    }
}

#[tonic::async_trait]
impl ContentAddressableStorage for CasService {
    async fn find_missing_blobs(
        &self,
        request: Request<FindMissingBlobsRequest>,
    ) -> Result<Response<FindMissingBlobsResponse>, Status> {
        let digests = request
            .into_inner()
            .blob_digests
            .into_iter()
            .map(|d| required_digest(Some(d), "blob_digests"))
            .collect::<Result<Vec<_>, _>>()?;

        let missing = self.cache.find_missing(&digests).await?;
        tracing::debug!(
            requested = digests.len(),
            missing = missing.len(),
            "FindMissingBlobs"
        );

        Ok(Response::new(FindMissingBlobsResponse {
            missing_blob_digests: missing.into_iter().map(Into::into).collect(),
        }))
    }

    async fn batch_update_blobs(
        &self,
        request: Request<BatchUpdateBlobsRequest>,
    ) -> Result<Response<BatchUpdateBlobsResponse>, Status> {
        let requests = request.into_inner().requests;

        check_batch_size(requests.iter().map(|r| r.data.len() as i64))?;

        let mut responses = Vec::with_capacity(requests.len());
        for r in requests {
            let digest = required_digest(r.digest, "digest")?;
            let (code, message) = match self.cache.put_blob_verified(&digest, r.data).await {
                Ok(()) => (Code::Ok, String::new()),
                Err(e) => {
                    tracing::warn!(digest = %digest, error = %e, "Blob upload rejected");
                    (cache_error_code(&e), e.to_string())
                }
            };
            responses.push(batch_update_blobs_response::Response {
                digest: Some(digest.into()),
                code: code as i32,
                message,
            });
        }

        Ok(Response::new(BatchUpdateBlobsResponse { responses }))
    }

    async fn batch_read_blobs(
        &self,
        request: Request<BatchReadBlobsRequest>,
    ) -> Result<Response<BatchReadBlobsResponse>, Status> {
        let digests = request
            .into_inner()
            .digests
            .into_iter()
            .map(|d| required_digest(Some(d), "digests"))
            .collect::<Result<Vec<Digest>, _>>()?;

        check_batch_size(digests.iter().map(|d| d.size_bytes))?;

        let mut responses = Vec::with_capacity(digests.len());
        for digest in digests {
            let response = match self.cache.get_blob(&digest).await {
                Ok(data) => batch_read_blobs_response::Response {
                    digest: Some(digest.into()),
                    data,
                    code: Code::Ok as i32,
                    message: String::new(),
                },
                Err(e) => batch_read_blobs_response::Response {
                    digest: Some(digest.into()),
                    data: Vec::new(),
                    code: cache_error_code(&e) as i32,
                    message: e.to_string(),
                },
            };
            responses.push(response);
        }

        Ok(Response::new(BatchReadBlobsResponse { responses }))
    }
}

/// Action digest to action result mapping.
pub struct ActionCacheService {
    cache: CacheGateway,
}

impl ActionCacheService {
    pub fn new(cache: CacheGateway) -> Self {
        Self { cache }
    }
}

#[tonic::async_trait]
impl ActionCache for ActionCacheService {
    async fn get_action_result(
        &self,
        request: Request<GetActionResultRequest>,
    ) -> Result<Response<proto::ActionResult>, Status> {
        let digest = required_digest(request.into_inner().action_digest, "action_digest")?;
        let result = self.cache.get_action_result(&digest).await?;
        Ok(Response::new((&result).into()))
    }

    async fn update_action_result(
        &self,
        request: Request<UpdateActionResultRequest>,
    ) -> Result<Response<proto::ActionResult>, Status> {
        let req = request.into_inner();
        let digest = required_digest(req.action_digest, "action_digest")?;
        let result = ActionResult::try_from(
            req.action_result
                .ok_or_else(|| Status::invalid_argument("action_result is required"))?,
        )?;

        self.cache.put_action_result(&digest, &result).await?;
        tracing::debug!(action_digest = %digest, "Action result stored");
        Ok(Response::new((&result).into()))
    }
}
