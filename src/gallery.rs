use serde_json::Value;

use crate::documents::{self, DocumentStore};
use crate::error::PipelineError;
use crate::structs::{DownloadManifestItem, Folder, MediaAsset, Named, User, Wish};

/// Whether a record belongs to `user`.
///
/// Rows written before user ids existed only carry a username, so those are
/// matched by name. Two guests with the same name share those rows.
fn belongs_to(user: &User, user_id: Option<&str>, username: &str) -> bool {
    match user_id {
        Some(id) => id == user.id,
        None => username == user.name,
    }
}

/// Join users with their media and wishes. Folders come back in user order.
pub fn assemble_folders(users: Vec<User>, media: &[MediaAsset], wishes: &[Wish]) -> Vec<Folder> {
    users
        .into_iter()
        .map(|user| {
            let media = media
                .iter()
                .filter(|m| belongs_to(&user, m.user_id.as_deref(), &m.username))
                .cloned()
                .collect();
            let wishes = wishes
                .iter()
                .filter(|w| belongs_to(&user, w.user_id.as_deref(), &w.username))
                .cloned()
                .collect();
            Folder {
                user,
                media,
                wishes,
            }
        })
        .collect()
}

pub async fn build_folders(store: &dyn DocumentStore) -> Result<Vec<Folder>, PipelineError> {
    let (users, media, wishes) = tokio::try_join!(
        documents::fetch_all::<User>(store),
        documents::fetch_all::<MediaAsset>(store),
        documents::fetch_all::<Wish>(store),
    )?;
    Ok(assemble_folders(users, &media, &wishes))
}

/// One user's folder, read with field queries instead of full scans.
pub async fn folder_for_user(
    store: &dyn DocumentStore,
    user_id: &str,
) -> Result<Folder, PipelineError> {
    let user = documents::fetch_one::<User>(store, user_id)
        .await?
        .ok_or(PipelineError::NotFound)?;

    let id_value = Value::String(user.id.clone());
    let name_value = Value::String(user.name.clone());
    let (by_id_media, by_name_media, by_id_wishes, by_name_wishes) = tokio::try_join!(
        documents::fetch_where::<MediaAsset>(store, "userId", &id_value),
        documents::fetch_where::<MediaAsset>(store, "username", &name_value),
        documents::fetch_where::<Wish>(store, "userId", &id_value),
        documents::fetch_where::<Wish>(store, "username", &name_value),
    )?;

    let media = by_id_media
        .into_iter()
        .chain(by_name_media.into_iter().filter(|m| m.user_id.is_none()))
        .collect();
    let wishes = by_id_wishes
        .into_iter()
        .chain(by_name_wishes.into_iter().filter(|w| w.user_id.is_none()))
        .collect();

    Ok(Folder {
        user,
        media,
        wishes,
    })
}

/// Case-sensitive prefix match on the display name. An empty prefix keeps everything.
pub fn filter_by_name_prefix<T: Named>(items: Vec<T>, prefix: &str) -> Vec<T> {
    if prefix.is_empty() {
        return items;
    }
    items
        .into_iter()
        .filter(|item| item.display_name().starts_with(prefix))
        .collect()
}

/// Every asset, optionally narrowed to uploaders whose name starts with `prefix`.
pub async fn flat_gallery(
    store: &dyn DocumentStore,
    prefix: &str,
) -> Result<Vec<MediaAsset>, PipelineError> {
    let media = documents::fetch_all::<MediaAsset>(store).await?;
    Ok(filter_by_name_prefix(media, prefix))
}

pub async fn download_manifest(
    store: &dyn DocumentStore,
) -> Result<Vec<DownloadManifestItem>, PipelineError> {
    let media = documents::fetch_all::<MediaAsset>(store).await?;
    Ok(media
        .into_iter()
        .map(|m| DownloadManifestItem {
            id: m.id,
            filename: m.filename,
            username: m.username,
            download_url: m.download_url,
        })
        .collect())
}
