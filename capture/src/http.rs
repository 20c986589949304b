//! Static image pull – a single HTTP GET.

use aerocam_common::cameras::CameraSource;

use crate::error::FetchError;

pub(crate) async fn get(
    client: &reqwest::Client,
    source: &CameraSource,
) -> Result<Vec<u8>, FetchError> {
    let resp = client
        .get(&source.url)
        .timeout(source.timeout)
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(&e, source.timeout))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::from_status(status.as_u16()));
    }

    let bytes = resp
        .bytes()
        .await
        .map_err(|e| FetchError::from_reqwest(&e, source.timeout))?;
    Ok(bytes.to_vec())
}
