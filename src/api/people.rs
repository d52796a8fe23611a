//! People API

use super::{ApiError, WebexClient};
use crate::models::person::Person;

/// `GET /people/me`: the identity behind the current token.
pub async fn get_me(client: &WebexClient) -> Result<Person, ApiError> {
    client.get(&["people", "me"], &[]).await
}
