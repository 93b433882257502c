use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{FnArg, ItemFn, Pat, Type, parse_macro_input};

/// Derive a `TemplateFunction` implementation from a typed function.
///
/// The generated struct is named after the function in PascalCase with a
/// `Function` suffix (`fn clamp` becomes `ClampFunction`) and can be passed
/// straight to `Registry::register`.
///
/// Parameters bind positionally first; a parameter with no positional
/// argument left is looked up by keyword. Surplus positional arguments and
/// unknown keywords are a `TypeError`.
///
/// # Attribute syntax
///
/// ```ignore
/// #[weaver_function(name = "clamp")]
/// ```
///
/// # Supported parameter types
/// - `Value` accepts anything and defaults to `None` when omitted
/// - `String` requires a string
/// - `i64` requires an int
/// - `f64` accepts an int or a float
/// - `bool` requires a bool
/// - `Vec<Value>` requires a list or tuple
///
/// # Example
/// ```ignore
/// #[weaver_function(name = "clamp")]
/// fn clamp(value: f64, low: f64, high: f64) -> Result<Value, EvalError> {
///     Ok(Value::Float(value.max(low).min(high)))
/// }
///
/// registry.register(ClampFunction);
/// ```
#[proc_macro_attribute]
pub fn weaver_function(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as FunctionArgs);
    let input_fn = parse_macro_input!(item as ItemFn);

    let fn_name = &input_fn.sig.ident;
    let struct_name = format_ident!("{}Function", to_pascal_case(&fn_name.to_string()));
    let func_name = &args.name;

    let mut param_extractions = Vec::new();
    let mut param_names = Vec::new();
    let mut param_types = Vec::new();
    let mut param_defs = Vec::new();

    for fn_arg in &input_fn.sig.inputs {
        if let FnArg::Typed(pat_type) = fn_arg
            && let Pat::Ident(ident) = &*pat_type.pat
        {
            let param_name = &ident.ident;
            let param_name_str = param_name.to_string();
            let ty = &*pat_type.ty;

            let extracted = generate_extraction(func_name, &param_name_str, ty);
            let value_type = extracted.value_type;
            let required = extracted.required;
            param_extractions.push(extracted.code);
            param_names.push(param_name.clone());
            param_types.push(extracted.rust_type);
            param_defs.push(quote! {
                weaver_comprehensions::registry::ParamDef {
                    name: #param_name_str.to_string(),
                    expected_type: Some(#value_type),
                    required: #required,
                }
            });
        }
    }

    let param_count = param_names.len();
    let fn_body = &input_fn.block;

    let output = quote! {
        pub struct #struct_name;

        impl #struct_name {
            fn execute(
                #(#param_names: #param_types),*
            ) -> Result<weaver_comprehensions::Value, weaver_comprehensions::EvalError> {
                #fn_body
            }
        }

        impl weaver_comprehensions::registry::TemplateFunction for #struct_name {
            fn call(
                &self,
                args: Vec<weaver_comprehensions::Value>,
                mut kwargs: weaver_comprehensions::registry::Kwargs,
            ) -> Result<weaver_comprehensions::Value, weaver_comprehensions::EvalError> {
                if args.len() > #param_count {
                    return Err(weaver_comprehensions::EvalError::new(
                        weaver_comprehensions::EvalErrorKind::TypeError,
                        format!(
                            "{}() takes {} positional arguments but {} were given",
                            #func_name,
                            #param_count,
                            args.len(),
                        ),
                    ));
                }
                let mut args = args.into_iter();
                #(#param_extractions)*
                weaver_comprehensions::registry::reject_kwargs(#func_name, &kwargs)?;
                Self::execute(#(#param_names),*)
            }

            fn signature(&self) -> weaver_comprehensions::registry::FunctionSignature {
                weaver_comprehensions::registry::FunctionSignature {
                    name: #func_name.to_string(),
                    params: vec![#(#param_defs),*],
                }
            }
        }
    };

    output.into()
}

struct Extraction {
    code: proc_macro2::TokenStream,
    value_type: proc_macro2::TokenStream,
    rust_type: proc_macro2::TokenStream,
    required: bool,
}

/// Generate the binding code for one parameter.
///
/// The generated code pulls the next positional argument, falls back to the
/// keyword of the same name, then validates and unwraps the value.
fn generate_extraction(func_name: &str, name: &str, ty: &Type) -> Extraction {
    let ident = format_ident!("{}", name);
    let type_str = quote!(#ty).to_string().replace(' ', "");

    let take = quote! {
        let #ident = match args.next() {
            Some(value) => Some(value),
            None => kwargs.shift_remove(#name),
        };
    };
    let missing = quote! {
        None => return Err(weaver_comprehensions::EvalError::new(
            weaver_comprehensions::EvalErrorKind::TypeError,
            format!("{}() missing required argument: '{}'", #func_name, #name),
        )),
    };
    let mismatch = |expected: &str| {
        quote! {
            Some(other) => return Err(
                weaver_comprehensions::EvalError::type_error(#expected, other.type_name())
            ),
        }
    };

    match type_str.as_str() {
        "String" => {
            let mismatch = mismatch("str");
            Extraction {
                code: quote! {
                    #take
                    let #ident = match #ident {
                        Some(weaver_comprehensions::Value::String(s)) => s,
                        #mismatch
                        #missing
                    };
                },
                value_type: quote! { weaver_comprehensions::registry::ValueType::String },
                rust_type: quote! { String },
                required: true,
            }
        }
        "i64" => {
            let mismatch = mismatch("int");
            Extraction {
                code: quote! {
                    #take
                    let #ident = match #ident {
                        Some(weaver_comprehensions::Value::Int(n)) => n,
                        #mismatch
                        #missing
                    };
                },
                value_type: quote! { weaver_comprehensions::registry::ValueType::Int },
                rust_type: quote! { i64 },
                required: true,
            }
        }
        "f64" => {
            let mismatch = mismatch("number");
            Extraction {
                code: quote! {
                    #take
                    let #ident = match #ident {
                        Some(weaver_comprehensions::Value::Float(n)) => n,
                        Some(weaver_comprehensions::Value::Int(n)) => n as f64,
                        #mismatch
                        #missing
                    };
                },
                value_type: quote! { weaver_comprehensions::registry::ValueType::Number },
                rust_type: quote! { f64 },
                required: true,
            }
        }
        "bool" => {
            let mismatch = mismatch("bool");
            Extraction {
                code: quote! {
                    #take
                    let #ident = match #ident {
                        Some(weaver_comprehensions::Value::Bool(b)) => b,
                        #mismatch
                        #missing
                    };
                },
                value_type: quote! { weaver_comprehensions::registry::ValueType::Bool },
                rust_type: quote! { bool },
                required: true,
            }
        }
        "Vec<Value>" => {
            let mismatch = mismatch("list");
            Extraction {
                code: quote! {
                    #take
                    let #ident = match #ident {
                        Some(weaver_comprehensions::Value::List(items))
                        | Some(weaver_comprehensions::Value::Tuple(items)) => items,
                        #mismatch
                        #missing
                    };
                },
                value_type: quote! { weaver_comprehensions::registry::ValueType::List },
                rust_type: quote! { Vec<weaver_comprehensions::Value> },
                required: true,
            }
        }
        _ => Extraction {
            code: quote! {
                #take
                let #ident = #ident.unwrap_or(weaver_comprehensions::Value::None);
            },
            value_type: quote! { weaver_comprehensions::registry::ValueType::Any },
            rust_type: quote! { weaver_comprehensions::Value },
            required: false,
        },
    }
}

fn to_pascal_case(s: &str) -> String {
    s.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                None => String::new(),
                Some(c) => c.to_uppercase().chain(chars).collect(),
            }
        })
        .collect()
}

// -- Attribute arg parsing -----------------------------------------------

struct FunctionArgs {
    name: String,
}

impl syn::parse::Parse for FunctionArgs {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let ident: syn::Ident = input.parse()?;
        if ident != "name" {
            return Err(syn::Error::new(ident.span(), "expected `name`"));
        }
        input.parse::<syn::Token![=]>()?;
        let lit: syn::LitStr = input.parse()?;
        Ok(FunctionArgs { name: lit.value() })
    }
}
