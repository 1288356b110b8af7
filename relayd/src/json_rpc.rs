use std::fmt::Debug;

use error_stack::Report;
use ethers::providers::{Http, JsonRpcClient, ProviderError, Ws};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::url::Url;

type Result<T> = error_stack::Result<T, ProviderError>;

/// Minimal JSON-RPC client over any ethers transport. The relay only needs a
/// handful of raw methods, so this stays below the full provider stack.
pub struct Client<P>
where
    P: JsonRpcClient,
{
    provider: P,
}

impl<P> Client<P>
where
    P: JsonRpcClient,
{
    pub fn new(provider: P) -> Self {
        Client { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub async fn request<T, R>(&self, method: &str, params: T) -> Result<R>
    where
        T: Debug + Serialize + Send + Sync,
        R: DeserializeOwned + Send,
    {
        self.provider
            .request(method, params)
            .await
            .map_err(Into::into)
            .map_err(Report::from)
    }
}

impl Client<Http> {
    pub fn new_http(url: &Url) -> Result<Self> {
        url.as_str()
            .parse()
            .map(Client::new)
            .map_err(|err: url::ParseError| ProviderError::CustomError(err.to_string()))
            .map_err(Report::from)
    }
}

impl Client<Ws> {
    pub async fn connect_ws(url: &Url) -> Result<Self> {
        Ws::connect(url.as_str())
            .await
            .map(Client::new)
            .map_err(Into::<ProviderError>::into)
            .map_err(Report::from)
    }
}
