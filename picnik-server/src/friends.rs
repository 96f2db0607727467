//! A request moves `pending -> accepted | rejected` exactly once. While it is
//! pending, a `pendingRequestPairs/<from>:<to>` index entry points at it and
//! is checked and written in the same transaction as the request.
use chrono::Utc;
use picnik_common::documents::{FriendProfile, FriendRequest, FriendRequestStatus, NotificationType, User, Versioned};
use picnik_common::{normalize_email, Decision, FriendRequestId, SendOutcome, UserId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::notifications::{self, NewNotification};
use crate::store::{abort, new_id, Filter, FRIEND_REQUESTS, PENDING_PAIRS, USERS};
use crate::State;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingPair {
    request_id: FriendRequestId,
}
impl Versioned for PendingPair {}

fn pair_key(from: &UserId, to: &UserId) -> String {
    format!("{from}:{to}")
}

enum Issued {
    Created,
    Reverse(FriendRequestId),
}

pub fn send_friend_request(state: &State, sender: &UserId, to_email: &str) -> Result<SendOutcome> {
    let from: User = state.store.require(USERS, &sender.0, "user")?;
    let email = normalize_email(to_email);
    let to: User = state
        .store
        .find_one(USERS, &Filter::eq("email", email.as_str()))?
        .ok_or_else(|| AppError::NotFound(format!("user with email {email}")))?;
    if to.id == from.id {
        return Err(AppError::InvalidOperation(
            "cannot send a friend request to yourself".into(),
        ));
    }
    if from.is_friend(&to.id) {
        return Err(AppError::InvalidOperation("already friends".into()));
    }

    let now = Utc::now();
    let request = FriendRequest {
        id: FriendRequestId(new_id()),
        from_user_id: from.id.clone(),
        to_user_id: to.id.clone(),
        status: FriendRequestStatus::Pending,
        from_profile: Some(from.profile()),
        to_profile: Some(to.profile()),
        created_at: now,
        updated_at: now,
    };
    let notification = NewNotification::new(
        NotificationType::FriendRequest,
        &from.id,
        &to.id,
        format!("{} sent you a friend request", from.display_name),
    )
    .data(json!({ "requestId": request.id }))
    .build();

    let issued = state.store.transaction(|tx| {
        if tx.get::<PendingPair>(PENDING_PAIRS, &pair_key(&from.id, &to.id))?.is_some() {
            return abort(AppError::AlreadyProcessed(
                "a friend request to this user is already pending".into(),
            ));
        }
        if let Some(reverse) = tx.get::<PendingPair>(PENDING_PAIRS, &pair_key(&to.id, &from.id))? {
            return Ok(Issued::Reverse(reverse.request_id));
        }
        let mut sender_doc: User = tx.require(USERS, &from.id.0, "user")?;
        let mut recipient_doc: User = tx.require(USERS, &to.id.0, "user")?;
        if sender_doc.is_friend(&recipient_doc.id) {
            return abort(AppError::InvalidOperation("already friends".into()));
        }
        sender_doc.sent_requests.push(request.id.clone());
        recipient_doc.received_requests.push(request.id.clone());

        tx.set(FRIEND_REQUESTS, &request.id.0, &request)?;
        tx.set(
            PENDING_PAIRS,
            &pair_key(&from.id, &to.id),
            &PendingPair {
                request_id: request.id.clone(),
            },
        )?;
        tx.set(USERS, &sender_doc.id.0, &sender_doc)?;
        tx.set(USERS, &recipient_doc.id.0, &recipient_doc)?;
        notifications::insert(tx, &notification)?;
        Ok(Issued::Created)
    })?;

    match issued {
        Issued::Created => {
            info!(request = %request.id, from = %from.id, to = %to.id, "friend request sent");
            notifications::dispatch(state, std::slice::from_ref(&notification));
            Ok(SendOutcome::Created(request))
        }
        Issued::Reverse(existing) => {
            info!(request = %existing, "reverse request pending, accepting it");
            let accepted = respond_to_friend_request(state, &from.id, &existing, Decision::Accepted)?;
            Ok(SendOutcome::AcceptedExisting(accepted))
        }
    }
}

fn befriend(user: &mut User, other: FriendProfile) {
    if !user.friends.contains(&other.id) {
        user.friends.push(other.id.clone());
    }
    user.friend_profiles.insert(other.id.clone(), other);
    user.stats.friends = user.friends.len() as u32;
    user.updated_at = Utc::now();
}

fn unfriend(user: &mut User, other: &UserId) -> bool {
    let before = user.friends.len();
    user.friends.retain(|id| id != other);
    let had_profile = user.friend_profiles.remove(other).is_some();
    let changed = user.friends.len() != before || had_profile;
    if changed {
        user.stats.friends = user.friends.len() as u32;
        user.updated_at = Utc::now();
    }
    changed
}

/// Resolves a pending request. Not idempotent: a resolved request yields
/// `AlreadyProcessed`.
pub fn respond_to_friend_request(
    state: &State,
    responder: &UserId,
    request_id: &FriendRequestId,
    decision: Decision,
) -> Result<FriendRequest> {
    let request = state.store.transaction(|tx| {
        let mut request: FriendRequest = tx.require(FRIEND_REQUESTS, &request_id.0, "friend request")?;
        if &request.to_user_id != responder {
            return abort(AppError::PermissionDenied(
                "only the recipient can respond to a friend request".into(),
            ));
        }
        if request.status != FriendRequestStatus::Pending {
            return abort(AppError::AlreadyProcessed(format!(
                "friend request {} was already processed",
                request.id
            )));
        }
        request.status = match decision {
            Decision::Accepted => FriendRequestStatus::Accepted,
            Decision::Rejected => FriendRequestStatus::Rejected,
        };
        request.updated_at = Utc::now();
        tx.set(FRIEND_REQUESTS, &request.id.0, &request)?;
        tx.delete(PENDING_PAIRS, &pair_key(&request.from_user_id, &request.to_user_id))?;

        if decision == Decision::Accepted {
            let mut from: User = tx.require(USERS, &request.from_user_id.0, "user")?;
            let mut to: User = tx.require(USERS, &request.to_user_id.0, "user")?;
            let (from_profile, to_profile) = (from.profile(), to.profile());
            befriend(&mut from, to_profile);
            befriend(&mut to, from_profile);
            tx.set(USERS, &from.id.0, &from)?;
            tx.set(USERS, &to.id.0, &to)?;
        }
        Ok(request)
    })?;
    info!(request = %request.id, status = ?request.status, "friend request resolved");
    Ok(request)
}

/// The sender withdraws a request that is still pending.
pub fn cancel_friend_request(state: &State, sender: &UserId, request_id: &FriendRequestId) -> Result<()> {
    state.store.transaction(|tx| {
        let request: FriendRequest = tx.require(FRIEND_REQUESTS, &request_id.0, "friend request")?;
        if &request.from_user_id != sender {
            return abort(AppError::PermissionDenied(
                "only the sender can cancel a friend request".into(),
            ));
        }
        if request.status != FriendRequestStatus::Pending {
            return abort(AppError::AlreadyProcessed(format!(
                "friend request {} was already processed",
                request.id
            )));
        }
        tx.delete(FRIEND_REQUESTS, &request.id.0)?;
        tx.delete(PENDING_PAIRS, &pair_key(&request.from_user_id, &request.to_user_id))?;
        for (id, sent) in [(&request.from_user_id, true), (&request.to_user_id, false)] {
            if let Some(mut user) = tx.get::<User>(USERS, &id.0)? {
                let list = if sent {
                    &mut user.sent_requests
                } else {
                    &mut user.received_requests
                };
                list.retain(|r| r != request_id);
                tx.set(USERS, &id.0, &user)?;
            }
        }
        Ok(())
    })
}

fn requests_where(state: &State, field: &'static str, user: &UserId) -> Result<Vec<FriendRequest>> {
    let filter = Filter::And(vec![
        Filter::eq(field, user.0.as_str()),
        Filter::eq("status", "pending"),
    ]);
    let mut requests: Vec<FriendRequest> = state.store.query(FRIEND_REQUESTS, &filter)?;
    requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(requests)
}

/// Pending requests addressed to `user`.
pub fn pending_requests(state: &State, user: &UserId) -> Result<Vec<FriendRequest>> {
    requests_where(state, "toUserId", user)
}

/// Pending requests `user` has sent.
pub fn sent_requests(state: &State, user: &UserId) -> Result<Vec<FriendRequest>> {
    requests_where(state, "fromUserId", user)
}

/// Cached profiles first; friends without a cached entry are looked up one
/// by one, and any that cannot be loaded are left out.
pub fn get_friends_list(state: &State, user: &UserId) -> Result<Vec<FriendProfile>> {
    let user: User = state.store.require(USERS, &user.0, "user")?;
    let mut friends = Vec::with_capacity(user.friends.len());
    for id in &user.friends {
        if let Some(profile) = user.friend_profiles.get(id) {
            friends.push(profile.clone());
            continue;
        }
        match state.store.get::<User>(USERS, &id.0) {
            Ok(Some(friend)) => friends.push(friend.profile()),
            Ok(None) => warn!(friend = %id, "friend profile missing, skipping"),
            Err(err) => warn!(friend = %id, "loading friend profile: {err}"),
        }
    }
    Ok(friends)
}

/// Removes the friendship on both sides. Returns whether anything changed;
/// removing someone who is not a friend is a successful no-op.
pub fn remove_friend(state: &State, user: &UserId, friend: &UserId) -> Result<bool> {
    let changed = state.store.transaction(|tx| {
        let mut a: User = tx.require(USERS, &user.0, "user")?;
        let mut b: User = tx.require(USERS, &friend.0, "user")?;
        let changed_a = unfriend(&mut a, &b.id);
        let changed_b = unfriend(&mut b, &a.id);
        if changed_a {
            tx.set(USERS, &a.id.0, &a)?;
        }
        if changed_b {
            tx.set(USERS, &b.id.0, &b)?;
        }
        Ok(changed_a || changed_b)
    })?;
    if changed {
        info!(%user, %friend, "friendship removed");
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::{test_state, test_user};

    fn user(state: &State, id: &UserId) -> User {
        state.store.require(USERS, &id.0, "user").unwrap()
    }

    fn created(outcome: SendOutcome) -> FriendRequest {
        match outcome {
            SendOutcome::Created(request) => request,
            other => panic!("expected a new request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_then_accept_makes_mutual_friends() {
        let (state, _dir) = test_state().await;
        let u1 = test_user(&state, "u1");
        let u2 = test_user(&state, "u2");

        let request = created(send_friend_request(&state, &u1, " U2@X.com ").unwrap());
        assert_eq!(request.status, FriendRequestStatus::Pending);
        assert_eq!(request.to_user_id, u2);
        assert_eq!(request.from_profile.as_ref().unwrap().email, "u1@x.com");
        assert_eq!(pending_requests(&state, &u2).unwrap(), vec![request.clone()]);
        assert_eq!(sent_requests(&state, &u1).unwrap().len(), 1);
        assert_eq!(user(&state, &u1).sent_requests, vec![request.id.clone()]);
        assert_eq!(user(&state, &u2).received_requests, vec![request.id.clone()]);
        assert_eq!(notifications::unread_count(&state, &u2).unwrap(), 1);

        let accepted = respond_to_friend_request(&state, &u2, &request.id, Decision::Accepted).unwrap();
        assert_eq!(accepted.status, FriendRequestStatus::Accepted);

        let (a, b) = (user(&state, &u1), user(&state, &u2));
        assert_eq!(a.friends, vec![u2.clone()]);
        assert_eq!(b.friends, vec![u1.clone()]);
        assert_eq!(a.friend_profiles[&u2].display_name, "u2");
        assert_eq!(b.friend_profiles[&u1].display_name, "u1");
        assert_eq!(a.stats.friends, 1);

        let friends_of_u1 = get_friends_list(&state, &u1).unwrap();
        assert_eq!(friends_of_u1, vec![b.profile()]);
        let friends_of_u2 = get_friends_list(&state, &u2).unwrap();
        assert_eq!(friends_of_u2, vec![a.profile()]);
        assert!(pending_requests(&state, &u2).unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_request_is_rejected_without_a_second_document() {
        let (state, _dir) = test_state().await;
        let u1 = test_user(&state, "u1");
        test_user(&state, "u2");

        created(send_friend_request(&state, &u1, "u2@x.com").unwrap());
        let again = send_friend_request(&state, &u1, "u2@x.com");
        assert!(matches!(again, Err(AppError::AlreadyProcessed(_))));

        let all: Vec<FriendRequest> = state.store.query(FRIEND_REQUESTS, &Filter::All).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn reverse_pending_request_is_accepted_instead() {
        let (state, _dir) = test_state().await;
        let u1 = test_user(&state, "u1");
        let u2 = test_user(&state, "u2");

        let original = created(send_friend_request(&state, &u2, "u1@x.com").unwrap());
        let outcome = send_friend_request(&state, &u1, "u2@x.com").unwrap();
        match &outcome {
            SendOutcome::AcceptedExisting(request) => {
                assert_eq!(request.id, original.id);
                assert_eq!(request.status, FriendRequestStatus::Accepted);
            }
            other => panic!("expected the reverse request to be accepted, got {other:?}"),
        }
        let all: Vec<FriendRequest> = state.store.query(FRIEND_REQUESTS, &Filter::All).unwrap();
        assert_eq!(all.len(), 1);
        assert!(user(&state, &u1).is_friend(&u2));
        assert!(user(&state, &u2).is_friend(&u1));

        let again = send_friend_request(&state, &u1, "u2@x.com");
        assert!(matches!(again, Err(AppError::InvalidOperation(_))));
    }

    fn pending_between(state: &State, a: &UserId, b: &UserId) -> usize {
        state
            .store
            .query::<FriendRequest>(FRIEND_REQUESTS, &Filter::All)
            .unwrap()
            .into_iter()
            .filter(|r| r.status == FriendRequestStatus::Pending)
            .filter(|r| (&r.from_user_id, &r.to_user_id) == (a, b) || (&r.from_user_id, &r.to_user_id) == (b, a))
            .count()
    }

    /// Runs every `(sender, recipient email)` send at once on its own thread.
    fn race(state: &State, sends: &[(UserId, String)]) -> Vec<Result<SendOutcome>> {
        let barrier = Barrier::new(sends.len());
        thread::scope(|scope| {
            let handles: Vec<_> = sends
                .iter()
                .map(|(sender, email)| {
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        send_friend_request(state, sender, email)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[tokio::test]
    async fn racing_senders_leave_one_pending_request() {
        let (state, _dir) = test_state().await;
        for round in 0..20 {
            let a = test_user(&state, &format!("a{round}"));
            let b = test_user(&state, &format!("b{round}"));
            let email = format!("b{round}@x.com");

            let results = race(&state, &vec![(a.clone(), email); 4]);
            let created = results
                .iter()
                .filter(|r| matches!(r, Ok(SendOutcome::Created(_))))
                .count();
            assert_eq!(created, 1, "round {round}: {results:?}");
            assert!(results
                .iter()
                .all(|r| matches!(r, Ok(SendOutcome::Created(_)) | Err(AppError::AlreadyProcessed(_)))));
            assert_eq!(pending_between(&state, &a, &b), 1);
            assert_eq!(user(&state, &a).sent_requests.len(), 1);
        }
    }

    #[tokio::test]
    async fn crossing_requests_never_leave_two_pending() {
        let (state, _dir) = test_state().await;
        for round in 0..20 {
            let a = test_user(&state, &format!("a{round}"));
            let b = test_user(&state, &format!("b{round}"));

            let results = race(
                &state,
                &[(a.clone(), format!("b{round}@x.com")), (b.clone(), format!("a{round}@x.com"))],
            );
            let created = results
                .iter()
                .filter(|r| matches!(r, Ok(SendOutcome::Created(_))))
                .count();
            assert!(created <= 1, "round {round}: {results:?}");
            assert!(pending_between(&state, &a, &b) <= 1);
            // Either one request is still pending or it was accepted by the
            // crossing send, never both.
            let friends = user(&state, &a).is_friend(&b);
            assert_eq!(friends, user(&state, &b).is_friend(&a));
            assert_eq!(friends, pending_between(&state, &a, &b) == 0);
        }
    }

    #[tokio::test]
    async fn responding_twice_fails() {
        let (state, _dir) = test_state().await;
        let u1 = test_user(&state, "u1");
        let u2 = test_user(&state, "u2");
        let request = created(send_friend_request(&state, &u1, "u2@x.com").unwrap());

        respond_to_friend_request(&state, &u2, &request.id, Decision::Accepted).unwrap();
        for decision in [Decision::Accepted, Decision::Rejected] {
            let second = respond_to_friend_request(&state, &u2, &request.id, decision);
            assert!(matches!(second, Err(AppError::AlreadyProcessed(_))));
        }
        assert_eq!(user(&state, &u1).friends, vec![u2]);
    }

    #[tokio::test]
    async fn rejection_leaves_friend_lists_alone_and_allows_a_new_request() {
        let (state, _dir) = test_state().await;
        let u1 = test_user(&state, "u1");
        let u2 = test_user(&state, "u2");
        let request = created(send_friend_request(&state, &u1, "u2@x.com").unwrap());

        let rejected = respond_to_friend_request(&state, &u2, &request.id, Decision::Rejected).unwrap();
        assert_eq!(rejected.status, FriendRequestStatus::Rejected);
        assert!(user(&state, &u1).friends.is_empty());
        assert!(user(&state, &u2).friend_profiles.is_empty());

        created(send_friend_request(&state, &u1, "u2@x.com").unwrap());
    }

    #[tokio::test]
    async fn guards() {
        let (state, _dir) = test_state().await;
        let u1 = test_user(&state, "u1");
        let u2 = test_user(&state, "u2");
        let u3 = test_user(&state, "u3");

        assert!(matches!(
            send_friend_request(&state, &u1, "U1@x.com"),
            Err(AppError::InvalidOperation(_))
        ));
        assert!(matches!(
            send_friend_request(&state, &u1, "nobody@x.com"),
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            send_friend_request(&state, &UserId("ghost".into()), "u2@x.com"),
            Err(AppError::NotFound(_))
        ));

        let request = created(send_friend_request(&state, &u1, "u2@x.com").unwrap());
        assert!(matches!(
            respond_to_friend_request(&state, &u3, &request.id, Decision::Accepted),
            Err(AppError::PermissionDenied(_))
        ));
        assert!(matches!(
            respond_to_friend_request(&state, &u2, &FriendRequestId("missing".into()), Decision::Accepted),
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_withdraws_a_pending_request() {
        let (state, _dir) = test_state().await;
        let u1 = test_user(&state, "u1");
        let u2 = test_user(&state, "u2");
        let request = created(send_friend_request(&state, &u1, "u2@x.com").unwrap());

        assert!(matches!(
            cancel_friend_request(&state, &u2, &request.id),
            Err(AppError::PermissionDenied(_))
        ));
        cancel_friend_request(&state, &u1, &request.id).unwrap();
        assert!(pending_requests(&state, &u2).unwrap().is_empty());
        assert!(user(&state, &u1).sent_requests.is_empty());
        assert!(user(&state, &u2).received_requests.is_empty());
        created(send_friend_request(&state, &u1, "u2@x.com").unwrap());
    }

    #[tokio::test]
    async fn remove_friend_twice_is_a_no_op() {
        let (state, _dir) = test_state().await;
        let u1 = test_user(&state, "u1");
        let u2 = test_user(&state, "u2");
        let request = created(send_friend_request(&state, &u1, "u2@x.com").unwrap());
        respond_to_friend_request(&state, &u2, &request.id, Decision::Accepted).unwrap();

        assert!(remove_friend(&state, &u1, &u2).unwrap());
        let after_first = (user(&state, &u1), user(&state, &u2));
        assert!(!remove_friend(&state, &u1, &u2).unwrap());
        let after_second = (user(&state, &u1), user(&state, &u2));

        assert_eq!(after_first, after_second);
        assert!(after_first.0.friends.is_empty() && after_first.0.friend_profiles.is_empty());
        assert!(after_first.1.friends.is_empty() && after_first.1.friend_profiles.is_empty());
        assert_eq!(after_first.0.stats.friends, 0);
    }

    #[tokio::test]
    async fn friends_list_falls_back_to_lookups_and_skips_missing() {
        let (state, _dir) = test_state().await;
        let u1 = test_user(&state, "u1");
        let u2 = test_user(&state, "u2");
        let mut doc = user(&state, &u1);
        doc.friends = vec![u2.clone(), UserId("deleted".into())];
        doc.friend_profiles = BTreeMap::new();
        state.store.set(USERS, &u1.0, &doc).unwrap();

        let friends = get_friends_list(&state, &u1).unwrap();
        assert_eq!(friends, vec![user(&state, &u2).profile()]);
    }
}
