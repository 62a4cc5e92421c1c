// Thin client for the control-plane HTTP API (`spec.md` §6). Every method
// maps one-to-one onto a capability bullet from the spec; none of them
// implement retry/backoff policy themselves beyond `reqwest-retry`'s
// `SendRetry`, which is the same crate `onefuzz-task` uses for its own HTTP
// calls.

use crate::error::PinguApiError;
use crate::model::{
    Bot, CoverageInformation, Crash, DataBundle, Fuzzer, FuzzTarget, FuzzTargetJob, Job, Project,
    Task, TaskStatus, Testcase, TestcaseVariant, Trial,
};
use bytes::Bytes;
use pingu_core::http::ResponseExt;
use reqwest::{Response, StatusCode, Url};
use reqwest_retry::SendRetry;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl Client {
    pub fn new(base_url: Url, api_key: Option<String>) -> Result<Self, PinguApiError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
        })
    }

    fn url(&self, path: &str) -> Result<Url, PinguApiError> {
        self.base_url
            .join(path)
            .map_err(PinguApiError::InvalidBaseUrl)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, PinguApiError> {
        let url = self.url(path)?;
        let request = self.authed(self.http.get(url));
        self.send_json(path, request).await
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, PinguApiError> {
        let url = self.url(path)?;
        let request = self.authed(self.http.post(url).json(body));
        self.send_json(path, request).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, PinguApiError> {
        let response = self.send(endpoint, request).await?;
        response
            .json::<T>()
            .await
            .map_err(|source| PinguApiError::Decode {
                endpoint: endpoint.to_owned(),
                source,
            })
    }

    async fn send(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Response, PinguApiError> {
        let response = request
            .send_retry_default()
            .await
            .map_err(|err| match err.downcast::<reqwest::Error>() {
                Ok(source) => PinguApiError::Request {
                    endpoint: endpoint.to_owned(),
                    source,
                },
                Err(err) => PinguApiError::Status {
                    endpoint: endpoint.to_owned(),
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    body: err.to_string(),
                },
            })?;
        response
            .error_for_status_with_body()
            .await
            .map_err(|err| PinguApiError::Status {
                endpoint: endpoint.to_owned(),
                status: StatusCode::BAD_REQUEST,
                body: err.to_string(),
            })
    }

    // --- Tasks -----------------------------------------------------------

    pub async fn get_next_task(&self) -> Result<Option<Task>, PinguApiError> {
        self.get_json("tasks/next").await
    }

    pub async fn add_task(&self, task: &Task) -> Result<Task, PinguApiError> {
        self.post_json("tasks", task).await
    }

    /// Returns `false` when another bot already holds this task's lease
    /// (`spec.md` §4.3's single-writer invariant / `AlreadyRunning`).
    pub async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
    ) -> Result<bool, PinguApiError> {
        #[derive(Serialize)]
        struct Body {
            status: TaskStatus,
        }
        self.post_json(&format!("tasks/{id}/status"), &Body { status })
            .await
    }

    pub async fn end_task(&self, id: Uuid) -> Result<(), PinguApiError> {
        let url = self.url(&format!("tasks/{id}/end"))?;
        self.send("end_task", self.authed(self.http.post(url)))
            .await?;
        Ok(())
    }

    // --- Bot ---------------------------------------------------------------

    /// `spec.md` §4.1: looked up once at supervisor startup to learn the
    /// bot's id (for `get_bot_config`), and polled after every worker exit
    /// to check `run_timed_out`.
    pub async fn get_bot(&self, name: &str) -> Result<Bot, PinguApiError> {
        self.get_json(&format!("bot/{name}")).await
    }

    pub async fn get_bot_config(&self, bot_id: Uuid) -> Result<String, PinguApiError> {
        let url = self.url(&format!("bot-config/{bot_id}"))?;
        let response = self
            .send("get_bot_config", self.authed(self.http.get(url)))
            .await?;
        response.text().await.map_err(|source| PinguApiError::Decode {
            endpoint: "get_bot_config".to_owned(),
            source,
        })
    }

    // --- Jobs / Projects / Fuzzers / FuzzTargets / DataBundles -------------

    pub async fn get_job(&self, id: Uuid) -> Result<Job, PinguApiError> {
        self.get_json(&format!("jobs/{id}")).await
    }

    pub async fn get_project(&self, id: Uuid) -> Result<Project, PinguApiError> {
        self.get_json(&format!("projects/{id}")).await
    }

    pub async fn get_fuzzer(&self, id: Uuid) -> Result<Fuzzer, PinguApiError> {
        self.get_json(&format!("fuzzers/{id}")).await
    }

    pub async fn get_fuzz_target(&self, fuzzer_id: Uuid, binary: &str) -> Result<FuzzTarget, PinguApiError> {
        self.get_json(&format!("fuzzers/{fuzzer_id}/targets/{binary}")).await
    }

    pub async fn list_fuzz_target_jobs(&self, job_id: Uuid) -> Result<Vec<FuzzTargetJob>, PinguApiError> {
        self.get_json(&format!("jobs/{job_id}/fuzz-target-jobs")).await
    }

    /// The reverse of `list_fuzz_target_jobs`: every job a fuzzer is attached
    /// to, used to fan out `variant` follow-up tasks across compatible jobs
    /// (`spec.md` §4.11).
    pub async fn list_jobs_for_fuzzer(&self, fuzzer_id: Uuid) -> Result<Vec<FuzzTargetJob>, PinguApiError> {
        self.get_json(&format!("fuzzers/{fuzzer_id}/jobs")).await
    }

    pub async fn get_data_bundle(&self, name: &str) -> Result<DataBundle, PinguApiError> {
        self.get_json(&format!("data-bundles/{name}")).await
    }

    /// `spec.md` §4.13: the ordered list of buildable revisions for a
    /// project's release build type, used by bisection.
    pub async fn list_revisions(&self, project_id: Uuid) -> Result<Vec<u64>, PinguApiError> {
        self.get_json(&format!("projects/{project_id}/revisions")).await
    }

    // --- Testcases / Crashes ------------------------------------------------

    pub async fn get_testcase(&self, id: Uuid) -> Result<Testcase, PinguApiError> {
        self.get_json(&format!("testcases/{id}")).await
    }

    pub async fn find_testcase(
        &self,
        project_id: Uuid,
        crash_type: &str,
        crash_state: &str,
        security_flag: bool,
    ) -> Result<Option<Testcase>, PinguApiError> {
        let path = format!(
            "testcases/find?project_id={project_id}&crash_type={}&crash_state={}&security_flag={security_flag}",
            urlencode(crash_type),
            urlencode(crash_state),
        );
        self.get_json(&path).await
    }

    pub async fn add_testcase(&self, testcase: &Testcase) -> Result<Testcase, PinguApiError> {
        self.post_json("testcases", testcase).await
    }

    pub async fn update_testcase(&self, testcase: &Testcase) -> Result<Testcase, PinguApiError> {
        self.post_json(&format!("testcases/{}", testcase.id), testcase).await
    }

    pub async fn update_testcase_comment(
        &self,
        id: Uuid,
        state: &str,
        message: &str,
    ) -> Result<(), PinguApiError> {
        #[derive(Serialize)]
        struct Body<'a> {
            state: &'a str,
            message: &'a str,
        }
        self.post_json::<_, serde_json::Value>(
            &format!("testcases/{id}/comment"),
            &Body { state, message },
        )
        .await?;
        Ok(())
    }

    pub async fn add_crash(&self, crash: &Crash) -> Result<Crash, PinguApiError> {
        self.post_json("crashes", crash).await
    }

    pub async fn update_crash(&self, crash: &Crash) -> Result<Crash, PinguApiError> {
        self.post_json(&format!("crashes/{}", crash.testcase_id), crash).await
    }

    // --- TestcaseVariants ----------------------------------------------------

    pub async fn get_testcase_variant(
        &self,
        testcase_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<TestcaseVariant>, PinguApiError> {
        self.get_json(&format!("testcase-variants/{testcase_id}/{job_id}")).await
    }

    pub async fn add_testcase_variant(
        &self,
        variant: &TestcaseVariant,
    ) -> Result<TestcaseVariant, PinguApiError> {
        self.post_json("testcase-variants", variant).await
    }

    pub async fn update_testcase_variant(
        &self,
        variant: &TestcaseVariant,
    ) -> Result<TestcaseVariant, PinguApiError> {
        self.post_json(&format!("testcase-variants/{}", variant.id), variant).await
    }

    // --- Fuzzer download / Corpus API ----------------------------------------

    pub async fn download_fuzzer(&self, fuzzer_id: Uuid) -> Result<Bytes, PinguApiError> {
        let url = self.url(&format!("fuzzers/{fuzzer_id}/download"))?;
        let response = self
            .send("download_fuzzer", self.authed(self.http.get(url)))
            .await?;
        response.bytes().await.map_err(|source| PinguApiError::Decode {
            endpoint: "download_fuzzer".to_owned(),
            source,
        })
    }

    pub async fn download_corpus(
        &self,
        project_id: Uuid,
        fuzz_target_id: Uuid,
        kind: crate::model::CorpusKind,
    ) -> Result<Bytes, PinguApiError> {
        let url = self.url(&format!(
            "corpus/{project_id}/{fuzz_target_id}/{kind:?}/download"
        ))?;
        let response = self
            .send("download_corpus", self.authed(self.http.get(url)))
            .await?;
        response.bytes().await.map_err(|source| PinguApiError::Decode {
            endpoint: "download_corpus".to_owned(),
            source,
        })
    }

    pub async fn upload_corpus_file(
        &self,
        project_id: Uuid,
        fuzz_target_id: Uuid,
        kind: crate::model::CorpusKind,
        file_name: &str,
        contents: Vec<u8>,
    ) -> Result<(), PinguApiError> {
        let url = self.url(&format!(
            "corpus/{project_id}/{fuzz_target_id}/{kind:?}/{file_name}"
        ))?;
        self.send(
            "upload_corpus_file",
            self.authed(self.http.put(url).body(contents)),
        )
        .await?;
        Ok(())
    }

    // --- Heartbeat ---------------------------------------------------------

    /// Posts a drained batch of heartbeat messages (`spec.md` §4.2's
    /// "posts an update heartbeat to the API"). Shared by the task-level
    /// `HeartbeatSink` (task liveness + structured events) and the bot-level
    /// heartbeat process (worker-log staleness).
    pub async fn send_heartbeat(&self, payload: serde_json::Value) -> Result<(), PinguApiError> {
        self.post_json::<_, serde_json::Value>("heartbeat", &payload)
            .await?;
        Ok(())
    }

    // --- Coverage information ---------------------------------------------

    pub async fn add_coverage_information(
        &self,
        info: &CoverageInformation,
    ) -> Result<(), PinguApiError> {
        self.post_json::<_, serde_json::Value>("coverage-information", info)
            .await?;
        Ok(())
    }

    // --- Trials ---------------------------------------------------------------

    pub async fn list_trials(&self, app_name: &str) -> Result<Vec<Trial>, PinguApiError> {
        self.get_json(&format!("trials?app_name={}", urlencode(app_name))).await
    }
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
