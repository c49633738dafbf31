use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AuthzError {
    #[error("Failed to load policy file `{path}`")]
    #[diagnostic(
        code(aperture::policy_load),
        help("Check that the file exists and contains valid KDL syntax")
    )]
    PolicyLoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(aperture::kdl_parse),
        help("Check your KDL file syntax — see https://kdl.dev for the specification")
    )]
    KdlParse(String),

    #[error("Invalid policy: {0}")]
    #[diagnostic(
        code(aperture::invalid_policy),
        help("Each rule node needs a `resource` type and may carry `actors`, `actions` and `condition` children")
    )]
    InvalidPolicy(String),

    #[error("Invalid condition expression: {0}")]
    #[diagnostic(
        code(aperture::invalid_condition),
        help("Supported operators: ==, !=, >, <, >=, <=, &&, ||, !, in. Paths use dot notation rooted at `actor`, `action` or `resource`")
    )]
    InvalidCondition(String),

    #[error("Type `{0}` is already registered")]
    #[diagnostic(code(aperture::duplicate_type))]
    DuplicateType(String),

    #[error("Unregistered type `{0}`")]
    #[diagnostic(
        code(aperture::unknown_type),
        help("Register the type with `RegistryBuilder::register` before building the registry")
    )]
    UnknownType(String),

    #[error("Unknown field `{field}` on type `{type_name}`")]
    #[diagnostic(code(aperture::unknown_field))]
    UnknownField { type_name: String, field: String },

    #[error("Invalid relationship: {0}")]
    #[diagnostic(
        code(aperture::invalid_relationship),
        help("Relationship correlation fields must be primitive fields on both the owning and the related type")
    )]
    InvalidRelationship(String),

    #[error("Unsupported policy construct: {0}")]
    #[diagnostic(
        code(aperture::unsupported_construct),
        help("The filter compiler only handles equality, membership, conjunction, disjunction and bounded relationship hops; rewrite the rule or check instances individually")
    )]
    UnsupportedConstruct(String),

    #[error("Relationship traversal exceeds the maximum depth of {depth} hops")]
    #[diagnostic(code(aperture::relation_depth))]
    RelationDepthExceeded { depth: usize },

    #[error("Policy evaluation error: {0}")]
    #[diagnostic(code(aperture::evaluation))]
    Evaluation(String),

    #[error("Backend execution error: {0}")]
    #[diagnostic(code(aperture::backend))]
    Backend(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(aperture::io))]
    Io(#[from] std::io::Error),
}
