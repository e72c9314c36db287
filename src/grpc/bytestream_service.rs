use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use uuid::Uuid;

use crate::cache::{CacheGateway, Digest};
use crate::proto::byte_stream_server::ByteStream;
use crate::proto::{ReadRequest, ReadResponse, WriteRequest, WriteResponse};

/// Size of each chunk sent by `Read`.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Parse a read resource name, `[{instance}/]blobs/{hash}/{size}`.
pub fn parse_read_resource(name: &str) -> Result<Digest, Status> {
    let segments: Vec<&str> = name.split('/').collect();
    let at = segments
        .iter()
        .rposition(|s| *s == "blobs")
        .ok_or_else(|| invalid_resource(name))?;
    digest_from_segments(name, &segments[at + 1..])
}

/// Parse a write resource name,
/// `[{instance}/]uploads/{uuid}/blobs/{hash}/{size}[/{filename}]`.
pub fn parse_write_resource(name: &str) -> Result<Digest, Status> {
    let segments: Vec<&str> = name.split('/').collect();
    let at = segments
        .iter()
        .position(|s| *s == "uploads")
        .ok_or_else(|| invalid_resource(name))?;

    match segments.get(at + 1..at + 3) {
        Some([upload_id, "blobs"]) if Uuid::parse_str(upload_id).is_ok() => {}
        _ => return Err(invalid_resource(name)),
    }
    // Anything after the size is an optional client-side file name.
    let rest = &segments[at + 3..];
    digest_from_segments(name, &rest[..rest.len().min(2)])
}

fn digest_from_segments(name: &str, segments: &[&str]) -> Result<Digest, Status> {
    let [hash, size] = segments else {
        return Err(invalid_resource(name));
    };
    let size_bytes: i64 = size.parse().map_err(|_| invalid_resource(name))?;
    let digest = Digest::new(*hash, size_bytes);
    if !digest.is_valid() {
        return Err(invalid_resource(name));
    }
    Ok(digest)
}

fn invalid_resource(name: &str) -> Status {
    Status::invalid_argument(format!("Invalid resource name: {}", name))
}

/// Streaming access to blobs too large for the batch calls.
pub struct ByteStreamService {
    cache: CacheGateway,
}

impl ByteStreamService {
    pub fn new(cache: CacheGateway) -> Self {
        Self { cache }
    }
}

#[tonic::async_trait]
impl ByteStream for ByteStreamService {
    type ReadStream = Pin<Box<dyn Stream<Item = Result<ReadResponse, Status>> + Send>>;

    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        let req = request.into_inner();
        let digest = parse_read_resource(&req.resource_name)?;

        if req.read_offset < 0 || req.read_offset > digest.size_bytes {
            return Err(Status::out_of_range(format!(
                "Read offset {} outside of blob {}",
                req.read_offset, digest
            )));
        }
        if req.read_limit < 0 {
            return Err(Status::invalid_argument("Read limit must not be negative"));
        }

        let data = self.cache.get_blob(&digest).await?;
        let start = (req.read_offset as usize).min(data.len());
        let end = match req.read_limit {
            0 => data.len(),
            limit => data.len().min(start.saturating_add(limit as usize)),
        };
        let slice = data[start..end].to_vec();

        tracing::debug!(digest = %digest, offset = start, len = slice.len(), "ByteStream read");

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for chunk in slice.chunks(READ_CHUNK_SIZE) {
                let response = ReadResponse {
                    data: chunk.to_vec(),
                };
                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        let mut stream = request.into_inner();

        let mut digest: Option<Digest> = None;
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(message) = stream.next().await {
            let message = message?;

            let expected = match &digest {
                Some(d) => {
                    if !message.resource_name.is_empty()
                        && parse_write_resource(&message.resource_name)? != *d
                    {
                        return Err(Status::invalid_argument(
                            "Resource name changed during write",
                        ));
                    }
                    d.clone()
                }
                None => {
                    let d = parse_write_resource(&message.resource_name)?;
                    // The declared size is client input; grow with the data instead.
                    buffer.reserve((d.size_bytes.max(0) as usize).min(READ_CHUNK_SIZE));
                    digest = Some(d.clone());
                    d
                }
            };

            if message.write_offset != buffer.len() as i64 {
                return Err(Status::invalid_argument(format!(
                    "Write offset {} does not match committed size {}",
                    message.write_offset,
                    buffer.len()
                )));
            }
            buffer.extend_from_slice(&message.data);
            if buffer.len() as i64 > expected.size_bytes {
                return Err(Status::invalid_argument(format!(
                    "Received more than the {} bytes declared for {}",
                    expected.size_bytes, expected
                )));
            }

            if message.finish_write {
                let committed_size = buffer.len() as i64;
                self.cache.put_blob_verified(&expected, buffer).await?;
                tracing::debug!(digest = %expected, "ByteStream write committed");
                return Ok(Response::new(WriteResponse { committed_size }));
            }
        }

        Err(Status::invalid_argument(
            "Write stream ended without finish_write",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash() -> String {
        Digest::of(b"hello").hash
    }

    #[test]
    fn parse_read_names() {
        let d = parse_read_resource(&format!("blobs/{}/5", hash())).unwrap();
        assert_eq!(d, Digest::of(b"hello"));

        let d = parse_read_resource(&format!("main/blobs/{}/5", hash())).unwrap();
        assert_eq!(d.size_bytes, 5);
    }

    #[test]
    fn parse_read_rejects_garbage() {
        for name in [
            "",
            "blobs",
            "blobs/abc/5",
            &format!("blobs/{}", hash()),
            &format!("blobs/{}/five", hash()),
            &format!("blobs/{}/-1", hash()),
            &format!("blobs/{}/5/extra", hash()),
        ] {
            let err = parse_read_resource(name).unwrap_err();
            assert_eq!(err.code(), tonic::Code::InvalidArgument, "{name}");
        }
    }

    #[test]
    fn parse_write_names() {
        let id = Uuid::new_v4();
        let d = parse_write_resource(&format!("uploads/{}/blobs/{}/5", id, hash())).unwrap();
        assert_eq!(d, Digest::of(b"hello"));

        let d = parse_write_resource(&format!(
            "main/uploads/{}/blobs/{}/5/hello.txt",
            id,
            hash()
        ))
        .unwrap();
        assert_eq!(d, Digest::of(b"hello"));
    }

    #[test]
    fn parse_write_requires_upload_id() {
        assert!(parse_write_resource(&format!("blobs/{}/5", hash())).is_err());
        assert!(parse_write_resource(&format!("uploads/not-a-uuid/blobs/{}/5", hash())).is_err());
        assert!(parse_write_resource(&format!("uploads/{}/blobs", Uuid::new_v4())).is_err());
    }
}
