use llm_host_models::Response;

use crate::native::{NativeError, NativeResponse};

/// Copies a native response into an owned [`Response`].
///
/// Takes the native response by value: its memory is released when this
/// function returns, whether copying succeeded or not.
pub fn marshal_response<R: NativeResponse>(native: R) -> Result<Response, NativeError> {
    let count = native.candidate_count();
    let mut candidates = Vec::with_capacity(count);
    for index in 0..count {
        candidates.push(native.candidate(index)?);
    }
    let done = native.is_done();
    drop(native);
    Ok(Response { candidates, done })
}
