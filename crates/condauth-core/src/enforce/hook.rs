//! Pre-commit write checks.
//!
//! The hook runs immediately before a transaction applies its writes:
//!
//! 1. modified entities that existed before the transaction are asserted
//!    writable against committed storage, so a row cannot be rewritten into
//!    a shape its writer may edit;
//! 2. a nested level is committed, firing deferred triggers;
//! 3. modified entities are asserted again in the outer transaction, so the
//!    new content and changes made by triggers are checked too;
//! 4. created entities are asserted once in the outer transaction;
//! 5. deleted entities are asserted against committed storage.
//!
//! Any failure aborts the commit. A check started while another is running
//! for the same context returns immediately.

use condauth_proto::EntityRef;
use tracing::{debug, info};

use super::access::AccessControl;
use crate::error::AuthResult;
use crate::security::{AuditEvent, AuthContext};
use crate::storage::{group_by_type, Transaction};

/// Enlistment key of the write-check hook.
pub const WRITE_CHECK_HOOK: &str = "condauth.write_check";

/// Assert write access on everything `tx` created, modified, or deleted.
pub fn check_writes(access: &AccessControl, ctx: &AuthContext, tx: &mut Transaction<'_>) -> AuthResult<()> {
    if ctx.scope().authorization_disabled() {
        access.audit.log(AuditEvent::authorization_bypassed(
            ctx,
            "commit",
            "*",
        ));
        return Ok(());
    }

    if ctx.scope().is_in_save() {
        debug!("write check already running");
        return Ok(());
    }
    let _saving = ctx.in_save();
    let _unfiltered = ctx.disable_query_filter();

    for (key, reason) in tx.skipped() {
        info!(entity = %key, reason = %reason, "write check skipped");
        access
            .audit
            .log(AuditEvent::write_check_skipped(ctx, key.clone(), reason.clone()));
    }

    let committed = tx.tracker().modified_committed();
    check_bucket(access, ctx, tx.engine(), &committed, "modified before")?;
    tx.nested().commit()?;

    let tracker = tx.tracker().clone();
    check_bucket(access, ctx, &*tx, &tracker.modified(), "modified after")?;
    check_bucket(access, ctx, &*tx, &tracker.created(), "created")?;
    check_bucket(access, ctx, tx.engine(), &tracker.deleted(), "deleted")?;
    Ok(())
}

fn check_bucket<S>(
    access: &AccessControl,
    ctx: &AuthContext,
    source: &S,
    keys: &[EntityRef],
    bucket: &str,
) -> AuthResult<()>
where
    S: crate::storage::EntitySource + ?Sized,
{
    for (entity, ids) in group_by_type(keys) {
        debug!(entity = %entity, count = ids.len(), bucket, "checking entities");
        let _writing = ctx.writing(&entity);
        access.batch_assert_write(ctx, source, &entity, &ids)?;
    }
    Ok(())
}
