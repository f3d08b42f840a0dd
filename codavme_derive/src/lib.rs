use proc_macro::TokenStream;
use quote::quote;
use syn::{parse, parse_macro_input, DeriveInput};

#[proc_macro_derive(RegisterSerde)]
/// Derived on a packed_struct to shim in our bus serde methods on packed structs
pub fn derive_register_serde(tokens: TokenStream) -> TokenStream {
    let input = parse_macro_input!(tokens as DeriveInput);
    let reg_name = input.ident;
    let generated = quote! {
        impl Serialize for #reg_name {
            type Chunk = <Self as PackedStruct>::ByteArray;

            fn serialize(&self) -> Result<Self::Chunk, packed_struct::PackingError> {
                self.pack()
            }
        }

        impl Deserialize for #reg_name {
            type Chunk = <Self as PackedStruct>::ByteArray;

            fn deserialize(chunk: Self::Chunk) -> Result<Self, packed_struct::PackingError> {
                Self::unpack(&chunk)
            }
        }
    };
    TokenStream::from(generated)
}

/// Attaches the byte offset of a register from its board's A24 base address
#[proc_macro_attribute]
pub fn offset(attr: TokenStream, item: TokenStream) -> TokenStream {
    let num = match parse::<syn::Lit>(attr).expect("Error parsing attribute") {
        syn::Lit::Int(v) => v,
        _ => panic!("The offset must be a literal integer"),
    };
    if num.base10_parse::<u32>().is_err() {
        panic!("The offset must fit in the 32-bit VME address space");
    }
    // Get the struct name this offset is for
    let item = parse_macro_input!(item as DeriveInput);
    let ident = item.clone().ident;

    let generated = quote! {
        impl Offset for #ident {
            fn offset() -> u32 {
                #num as u32
            }
        }
        #item
    };
    TokenStream::from(generated)
}
