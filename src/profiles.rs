use crate::{model::Profile, remote::RemoteStore, ChatResult};

/// Search-as-you-type over display names. A blank term never reaches the store.
pub async fn search(store: &dyn RemoteStore, term: &str) -> ChatResult<Vec<Profile>> {
    let term = term.trim();
    if term.is_empty() {
        return Ok(Vec::new());
    }
    store.search_profiles(term).await
}
