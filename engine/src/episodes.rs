use uuid::Uuid;

use tally_core::error::DomainError;
use tally_core::model::{Episode, EpisodeKind};
use tally_core::reply::Outcome;

use crate::clock::Clock;
use crate::store::Store;

/// Open an episode of the given kind. The single-open invariant lives in
/// the store's conditional insert; a failed condition maps straight to
/// `AlreadyOpen`.
pub async fn start<S: Store, K: Clock>(
    store: &S,
    clock: &K,
    user_id: &str,
    kind: EpisodeKind,
) -> Result<Outcome, DomainError> {
    let episode = Episode {
        id: Uuid::now_v7(),
        user_id: user_id.to_string(),
        kind,
        started_at: clock.now_utc(),
        ended_at: None,
        open: true,
    };
    if !store.open_episode(&episode).await? {
        return Err(DomainError::AlreadyOpen { kind });
    }
    tracing::info!(user_id, kind = kind.as_str(), episode_id = %episode.id, "episode started");
    Ok(Outcome::EpisodeStarted { episode })
}

/// Close the open episode of the given kind, reporting its duration.
pub async fn end<S: Store, K: Clock>(
    store: &S,
    clock: &K,
    user_id: &str,
    kind: EpisodeKind,
) -> Result<Outcome, DomainError> {
    let ended_at = clock.now_utc();
    let Some(episode) = store.close_episode(user_id, kind, ended_at).await? else {
        return Err(DomainError::NoOpenEpisode { kind });
    };
    let duration_minutes = (ended_at - episode.started_at).num_minutes();
    tracing::info!(
        user_id,
        kind = kind.as_str(),
        episode_id = %episode.id,
        duration_minutes,
        "episode ended"
    );
    Ok(Outcome::EpisodeEnded {
        episode,
        duration_minutes,
    })
}

/// Report the open episode of the given kind, if any. For fasting this
/// also carries the configured goal so the reply can show progress.
pub async fn status<S: Store, K: Clock>(
    store: &S,
    clock: &K,
    user_id: &str,
    kind: EpisodeKind,
) -> Result<Outcome, DomainError> {
    let open = store.find_open_episode(user_id, kind).await?;
    let elapsed_minutes = open
        .as_ref()
        .map(|episode| (clock.now_utc() - episode.started_at).num_minutes());
    let goal_minutes = match kind {
        EpisodeKind::Fasting => store.fast_goal(user_id).await?,
        EpisodeKind::Migraine => None,
    };
    Ok(Outcome::EpisodeStatus {
        kind,
        open,
        elapsed_minutes,
        goal_minutes,
    })
}

/// Persist the fasting duration target.
pub async fn set_fast_goal<S: Store>(
    store: &S,
    user_id: &str,
    hours: f64,
) -> Result<Outcome, DomainError> {
    let minutes = (hours * 60.0).round() as i64;
    store.set_fast_goal(user_id, minutes).await?;
    Ok(Outcome::FastGoalSet { hours })
}
