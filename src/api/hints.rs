use std::convert::Infallible;

use rocket::request::{FromRequest, Outcome, Request};

use crate::images::ImageFormat;
use crate::negotiate::{negotiate_from_headers, FormatSupport, CLIENT_FORMATS_COOKIE};

/// Format capability signals carried by a request.
#[derive(Debug, Clone, Default)]
pub struct ClientHints {
    pub client_report: Option<String>,
    pub accept: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientHints {
    pub fn support(&self) -> FormatSupport {
        negotiate_from_headers(
            self.client_report.as_deref(),
            self.accept.as_deref(),
            self.user_agent.as_deref(),
        )
    }

    pub fn best_format(&self) -> ImageFormat {
        self.support().best_format()
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientHints {
    type Error = Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let header = |name: &str| req.headers().get_one(name).map(str::to_string);
        Outcome::Success(ClientHints {
            client_report: req
                .cookies()
                .get(CLIENT_FORMATS_COOKIE)
                .map(|cookie| cookie.value().to_string()),
            accept: header("Accept"),
            user_agent: header("User-Agent"),
        })
    }
}
