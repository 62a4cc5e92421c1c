// Impact task (`spec.md` §4.11 follow-up): records which of the project's
// known revisions this testcase's crash affects, by checking whether the
// crash's regression range overlaps the newest available revisions.
// Grounded on `crate::revision::RevisionList`, the same ordered-revision
// primitive bisection uses.

use crate::tasks::config::CommonConfig;
use crate::revision::RevisionList;
use anyhow::Result;

pub async fn run(common: CommonConfig) -> Result<()> {
    let testcase_id = common.testcase_id()?;
    let mut testcase = common.api.get_testcase(testcase_id).await?;
    let job = common.api.get_job(testcase.job_id).await?;
    let project = common.api.get_project(job.project_id).await?;

    let revisions = RevisionList::new(common.api.list_revisions(project.id).await?);
    if revisions.is_empty() {
        return Ok(());
    }
    let latest = revisions.get(revisions.len() - 1).unwrap();

    let regressed_since = parse_range_max(&testcase.regression);
    let fixed_since = parse_range_max(&testcase.fixed);

    let affects_latest = match (regressed_since, fixed_since) {
        (Some(regression_max), Some(fixed_max)) => regression_max >= fixed_max,
        (Some(_), None) => true,
        _ => false,
    };

    let mut metadata = if testcase.additional_metadata.is_object() {
        testcase.additional_metadata.clone()
    } else {
        serde_json::json!({})
    };
    metadata["impact_latest_revision"] = serde_json::Value::from(latest);
    metadata["impact_affects_latest"] = serde_json::Value::from(affects_latest);
    testcase.additional_metadata = metadata;

    common.api.update_testcase(&testcase).await?;
    Ok(())
}

fn parse_range_max(range: &str) -> Option<u64> {
    if range == "NA" {
        return None;
    }
    range.split_once(':').and_then(|(_, max)| max.parse().ok())
}
